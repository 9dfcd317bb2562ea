use std::sync::Arc;

use dashmap::DashMap;
use feed_angel::FeedHandle;
use infra_clock::MarketClock;
use metrics_exporter_prometheus::PrometheusHandle;
use scrip_directory::{OhlcProvider, ScripDirectory};
use uuid::Uuid;

use crate::channel::ChannelHandle;
use crate::config::ServerConfig;
use crate::registry::SessionRegistry;

/// Shared application state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub clock: Arc<dyn MarketClock>,
    pub feed: FeedHandle,
    pub scrips: Arc<ScripDirectory>,
    pub ohlc: Arc<dyn OhlcProvider>,
    /// Live downstream channels, for the heartbeat task.
    pub channels: Arc<DashMap<Uuid, ChannelHandle>>,
    pub prometheus: PrometheusHandle,
}
