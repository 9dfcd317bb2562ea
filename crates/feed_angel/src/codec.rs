//! Wire codec for the broker's streaming protocol: JSON control frames out,
//! fixed-layout binary LTP packets in.

use std::collections::BTreeMap;

use core_types::{BrokerTokens, Exchange, InstrumentId, Tick};
use serde_json::{json, Value};
use thiserror::Error;

/// LTP-mode packet layout: mode byte, exchange-type byte, NUL-padded ASCII
/// token in bytes 2..27, sequence 27..35, exchange timestamp (epoch ms)
/// 35..43, last traded price in paise as LE i64 in 43..51.
pub const LTP_PACKET_LEN: usize = 51;

pub const SUBSCRIBE_ACTION: i64 = 1;
pub const UNSUBSCRIBE_ACTION: i64 = 0;
pub const LTP_MODE: i64 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown exchange code {0}")]
    UnknownExchange(u8),
    #[error("token field is not valid ascii")]
    BadToken,
}

pub fn decode_ltp_packet(frame: &[u8]) -> Result<Tick, DecodeError> {
    if frame.len() < LTP_PACKET_LEN {
        return Err(DecodeError::TooShort(frame.len()));
    }

    let exchange =
        Exchange::from_stream_code(frame[1]).ok_or(DecodeError::UnknownExchange(frame[1]))?;

    let token_field: Vec<u8> = frame[2..27].iter().copied().filter(|b| *b != 0).collect();
    let token = String::from_utf8(token_field).map_err(|_| DecodeError::BadToken)?;
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(DecodeError::BadToken);
    }

    let ts_server = i64::from_le_bytes(frame[35..43].try_into().expect("slice is 8 bytes"));
    let paise = i64::from_le_bytes(frame[43..51].try_into().expect("slice is 8 bytes"));

    Ok(Tick {
        exchange,
        token,
        ltp: paise as f64 / 100.0,
        ts_server,
    })
}

/// Inverse of `decode_ltp_packet`; used by the mock broker and tests.
pub fn encode_ltp_packet(tick: &Tick) -> Vec<u8> {
    let mut frame = vec![0u8; LTP_PACKET_LEN];
    frame[0] = LTP_MODE as u8;
    frame[1] = tick.exchange.stream_code();
    let token = tick.token.as_bytes();
    frame[2..2 + token.len().min(25)].copy_from_slice(&token[..token.len().min(25)]);
    frame[35..43].copy_from_slice(&tick.ts_server.to_le_bytes());
    let paise = (tick.ltp * 100.0).round() as i64;
    frame[43..51].copy_from_slice(&paise.to_le_bytes());
    frame
}

pub fn encode_auth_request(creds: &BrokerTokens) -> String {
    json!({
        "correlationID": "auth",
        "action": 0,
        "params": {
            "clientCode": creds.client_code,
            "feedToken": creds.feed_token,
            "apiKey": creds.api_key,
        }
    })
    .to_string()
}

fn encode_token_command(action: i64, correlation_id: &str, tokens: &[InstrumentId]) -> String {
    // Group by exchange so one delta covers mixed-exchange watchlists.
    let mut by_exchange: BTreeMap<u8, Vec<String>> = BTreeMap::new();
    for id in tokens {
        by_exchange
            .entry(id.exchange.stream_code())
            .or_default()
            .push(id.token.clone());
    }
    let token_list: Vec<Value> = by_exchange
        .into_iter()
        .map(|(exchange_type, tokens)| {
            json!({"exchangeType": exchange_type, "tokens": tokens})
        })
        .collect();

    json!({
        "correlationID": correlation_id,
        "action": action,
        "params": {
            "mode": LTP_MODE,
            "tokenList": token_list,
        }
    })
    .to_string()
}

pub fn encode_subscribe(correlation_id: &str, tokens: &[InstrumentId]) -> String {
    encode_token_command(SUBSCRIBE_ACTION, correlation_id, tokens)
}

pub fn encode_unsubscribe(correlation_id: &str, tokens: &[InstrumentId]) -> String {
    encode_token_command(UNSUBSCRIBE_ACTION, correlation_id, tokens)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    AuthAck { ok: bool, message: Option<String> },
    Pong,
    Other,
}

pub fn parse_control_frame(text: &str) -> ControlFrame {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("pong") {
        return ControlFrame::Pong;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return ControlFrame::Other;
    };
    if value.get("correlationID").and_then(Value::as_str) == Some("auth") {
        let ok = value.get("status").and_then(Value::as_bool).unwrap_or(false);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        return ControlFrame::AuthAck { ok, message };
    }
    ControlFrame::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick() -> Tick {
        Tick {
            exchange: Exchange::Nse,
            token: "2885".to_string(),
            ltp: 2500.55,
            ts_server: 1_709_500_000_000,
        }
    }

    #[test]
    fn ltp_packet_round_trips() {
        let frame = encode_ltp_packet(&tick());
        assert_eq!(frame.len(), LTP_PACKET_LEN);
        let decoded = decode_ltp_packet(&frame).expect("decode");
        assert_eq!(decoded, tick());
    }

    #[test]
    fn short_and_garbage_packets_are_rejected() {
        assert_eq!(decode_ltp_packet(&[0u8; 10]), Err(DecodeError::TooShort(10)));

        let mut frame = encode_ltp_packet(&tick());
        frame[1] = 9;
        assert_eq!(decode_ltp_packet(&frame), Err(DecodeError::UnknownExchange(9)));

        let mut frame = encode_ltp_packet(&tick());
        frame[2..27].fill(0);
        assert_eq!(decode_ltp_packet(&frame), Err(DecodeError::BadToken));
    }

    #[test]
    fn subscribe_command_groups_by_exchange() {
        let tokens = vec![
            InstrumentId::new(Exchange::Nse, "2885"),
            InstrumentId::new(Exchange::Bse, "500325"),
            InstrumentId::new(Exchange::Nse, "3045"),
        ];
        let raw = encode_subscribe("sub-1", &tokens);
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["action"], SUBSCRIBE_ACTION);
        assert_eq!(value["params"]["mode"], LTP_MODE);
        let list = value["params"]["tokenList"].as_array().expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["exchangeType"], 1);
        assert_eq!(list[0]["tokens"].as_array().unwrap().len(), 2);
        assert_eq!(list[1]["exchangeType"], 3);
    }

    #[test]
    fn control_frames_parse() {
        assert_eq!(parse_control_frame("pong"), ControlFrame::Pong);
        assert_eq!(
            parse_control_frame(r#"{"correlationID":"auth","status":true}"#),
            ControlFrame::AuthAck { ok: true, message: None }
        );
        assert_eq!(
            parse_control_frame(r#"{"correlationID":"auth","status":false,"message":"bad token"}"#),
            ControlFrame::AuthAck {
                ok: false,
                message: Some("bad token".to_string())
            }
        );
        assert_eq!(parse_control_frame("{}"), ControlFrame::Other);
        assert_eq!(parse_control_frame("not json"), ControlFrame::Other);
    }
}
