//! Socket.IO v4 text framing, as spoken over a plain WebSocket transport.
//!
//! Each WebSocket text frame carries one Engine.IO packet: a single digit
//! type followed by its payload. Engine.IO `message` packets (`4`) in turn
//! carry a Socket.IO packet, again prefixed by a type digit. Only the pieces
//! the chat client needs are modelled; binary packets are not used by the
//! chat server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const NEW_MESSAGE: &str = "newMessage";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Engine handshake with the session id and ping settings.
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    Connect,
    Disconnect,
    ConnectError(Value),
    Event(IncomingEvent),
    /// A packet type the client does not act on (acks, upgrades).
    Ignored,
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type {0:?}")]
    UnknownType(char),
    #[error("malformed event payload: {0}")]
    Payload(String),
}

pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(FrameError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => Ok(Frame::Open(serde_json::from_str(rest).unwrap_or(Value::Null))),
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '4' => decode_socket_packet(rest),
        '5' => Ok(Frame::Ignored),
        '6' => Ok(Frame::Noop),
        other => Err(FrameError::UnknownType(other)),
    }
}

fn decode_socket_packet(text: &str) -> Result<Frame, FrameError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(FrameError::Empty)?;
    let body = skip_ack_id(skip_namespace(chars.as_str()));
    match kind {
        '0' => Ok(Frame::Connect),
        '1' => Ok(Frame::Disconnect),
        '2' => decode_event(body),
        '3' => Ok(Frame::Ignored),
        '4' => Ok(Frame::ConnectError(serde_json::from_str(body).unwrap_or(Value::Null))),
        other => Err(FrameError::UnknownType(other)),
    }
}

fn skip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn skip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

fn decode_event(body: &str) -> Result<Frame, FrameError> {
    let parsed: Value = serde_json::from_str(body).map_err(|e| FrameError::Payload(e.to_string()))?;
    let Value::Array(mut items) = parsed else {
        return Err(FrameError::Payload("event is not an array".into()));
    };
    if items.is_empty() {
        return Err(FrameError::Payload("event has no name".into()));
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        other => return Err(FrameError::Payload(format!("event name is not a string: {other}"))),
    };
    let data = if items.is_empty() { Value::Null } else { items.swap_remove(0) };
    Ok(Frame::Event(IncomingEvent { event_type: name, data }))
}

pub fn pong() -> String {
    "3".to_string()
}

pub fn connect() -> String {
    "40".to_string()
}
