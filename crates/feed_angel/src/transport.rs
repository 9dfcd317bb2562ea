//! Transport seam: the production WebSocket connector and the stream trait
//! the client drives. Tests swap in `testing::MockBroker`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::BrokerTokens;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Debug)]
pub enum FeedFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
}

#[async_trait]
pub trait FeedStream: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()>;
    /// Next inbound frame; `None` means the peer closed the transport.
    async fn next_frame(&mut self) -> Result<Option<FeedFrame>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, creds: &BrokerTokens) -> Result<Box<dyn FeedStream>>;
}

pub struct WsTransport {
    endpoint: String,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, creds: &BrokerTokens) -> Result<Box<dyn FeedStream>> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .context("build feed upgrade request")?;
        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            format!("Bearer {}", creds.jwt_token)
                .parse()
                .context("jwt header")?,
        );
        headers.insert("x-api-key", creds.api_key.parse().context("api key header")?);
        headers.insert(
            "x-client-code",
            creds.client_code.parse().context("client code header")?,
        );
        headers.insert(
            "x-feed-token",
            creds.feed_token.parse().context("feed token header")?,
        );

        let (stream, _) = timeout(self.connect_timeout, connect_async(request))
            .await
            .context("feed connect timeout")?
            .context("feed connect")?;

        Ok(Box::new(WsFeedStream { inner: stream }))
    }
}

struct WsFeedStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedStream for WsFeedStream {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .context("feed send")
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.inner
            .send(Message::Pong(payload.into()))
            .await
            .context("feed pong")
    }

    async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        loop {
            let Some(message) = self.inner.next().await else {
                return Ok(None);
            };
            match message.context("feed read")? {
                Message::Text(text) => return Ok(Some(FeedFrame::Text(text.to_string()))),
                Message::Binary(bytes) => return Ok(Some(FeedFrame::Binary(bytes.to_vec()))),
                Message::Ping(payload) => return Ok(Some(FeedFrame::Ping(payload.to_vec()))),
                Message::Pong(_) => continue,
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
