//! Push-channel wire format.
//!
//! Frames are JSON text. The canonical shape is `{"event": .., "data": ..}`;
//! the socket.io style array `["event", data]` is accepted as well.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{RegisterUpdate, SalePreview};
use crate::error::Result;

pub const EVENT_JOIN: &str = "join";
pub const EVENT_REGISTER_UPDATED: &str = "register.updated";
pub const EVENT_SALE_COMPLETED: &str = "sale.completed";
pub const EVENT_NEW_ORDER: &str = "new-order";
pub const EVENT_ORDER_STATUS_UPDATED: &str = "order-status-updated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    RegisterUpdated(RegisterUpdate),
    SaleCompleted(SalePreview),
    /// Kitchen notification; consumers re-fetch instead of merging.
    KitchenRefresh(String),
}

pub fn join_message(room: &str) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        event: EVENT_JOIN.to_string(),
        data: Value::String(room.to_string()),
    })?)
}

fn parse_envelope(text: &str) -> Result<Envelope> {
    let value: Value = serde_json::from_str(text)?;
    if let Value::Array(mut parts) = value {
        let data = if parts.len() > 1 {
            parts.swap_remove(1)
        } else {
            Value::Null
        };
        let event = match parts.into_iter().next() {
            Some(Value::String(event)) => event,
            _ => String::new(),
        };
        return Ok(Envelope { event, data });
    }
    Ok(serde_json::from_value(value)?)
}

/// Decode one text frame. `Ok(None)` for events this client ignores.
pub fn decode(text: &str) -> Result<Option<ServerEvent>> {
    let envelope = parse_envelope(text)?;
    let event = match envelope.event.as_str() {
        EVENT_REGISTER_UPDATED => {
            ServerEvent::RegisterUpdated(serde_json::from_value(envelope.data)?)
        }
        EVENT_SALE_COMPLETED => ServerEvent::SaleCompleted(serde_json::from_value(envelope.data)?),
        EVENT_NEW_ORDER | EVENT_ORDER_STATUS_UPDATED => ServerEvent::KitchenRefresh(envelope.event),
        _ => return Ok(None),
    };
    Ok(Some(event))
}
