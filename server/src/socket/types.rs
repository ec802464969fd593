use std::fmt;

use serde::Serialize;
use serde_json::Value as JsonValue;

use loomcast_core::token::SessionPrincipal;

use crate::error::AppError;

/// Authenticated identity pinned to the socket at handshake time. Immutable
/// for the socket lifetime; a reconnect is a fresh handshake.
#[derive(Clone)]
pub struct SocketUserContext {
    pub principal: SessionPrincipal,
    pub user_id: String,
}

impl SocketUserContext {
    pub fn new(principal: SessionPrincipal) -> Self {
        let user_id = principal.user_id.to_string();
        Self { principal, user_id }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum SocketAck<T> {
    Data { data: T },
    Error { error: SocketAckError },
}

impl<T> SocketAck<T> {
    pub fn ok(data: T) -> Self {
        SocketAck::Data { data }
    }

    pub fn from_error(error: AppError) -> Self {
        SocketAck::Error {
            error: SocketAckError::from_app_error(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SocketAckError {
    pub status: u16,
    pub code: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl SocketAckError {
    pub fn from_app_error(error: AppError) -> Self {
        let (status, payload) = error.into_payload();
        Self {
            status: status.as_u16(),
            code: payload.code,
            error_type: payload.error_type,
            name: payload.name,
            message: payload.message,
            data: payload.data,
        }
    }
}

impl fmt::Display for SocketAckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
