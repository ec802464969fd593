use std::{str, sync::Arc};

use serde_json::Value as JsonValue;
use socketioxide::SocketIo;
use socketioxide::adapter::Adapter;
use socketioxide::handler::{ConnectMiddleware, Value};
use socketioxide::layer::SocketIoLayer;
use tracing::{error, info, warn};

use crate::{
    error::AppError,
    socket::types::SocketUserContext,
    state::AppState,
};

pub(crate) fn build_socket(state: Arc<AppState>) -> (SocketIoLayer, SocketIo) {
    SocketIo::builder()
        .with_state(state)
        .max_payload(1_000_000)
        .max_buffer_size(8_192)
        .build_layer()
}

/// Connect middleware: the handshake must resolve `auth.token` to a user
/// before any room state is touched. A rejected handshake closes the
/// connection with a serialized error payload.
#[derive(Clone)]
pub(crate) struct SocketAuthMiddleware {
    state: Arc<AppState>,
}

impl SocketAuthMiddleware {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    fn format_error(error: AppError) -> String {
        let (status, payload) = error.into_payload();
        match serde_json::to_string(&serde_json::json!({
            "status": status.as_u16(),
            "code": payload.code,
            "type": payload.error_type,
            "name": payload.name,
            "message": payload.message,
        })) {
            Ok(serialized) => serialized,
            Err(err) => {
                error!(?err, "failed to serialize websocket auth error");
                payload.message
            }
        }
    }

    fn extract_token(auth: Option<&Value>, query: Option<&str>) -> Option<String> {
        if let Some(value) = auth {
            if let Some(as_str) = value.as_str() {
                if let Some(token) = Self::token_from_str(as_str.as_ref()) {
                    return Some(token);
                }
            } else if let Some(bytes) = value.as_bytes() {
                if let Ok(text) = str::from_utf8(bytes.as_ref()) {
                    if let Some(token) = Self::token_from_str(text) {
                        return Some(token);
                    }
                }
            }
        }

        query.and_then(Self::token_from_query)
    }

    /// Accepts the canonical `{"token": "..."}` auth object, a bare token
    /// string, or query-pair form; clients differ across transports.
    fn token_from_str(payload: &str) -> Option<String> {
        let trimmed = payload.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(json) = serde_json::from_str::<JsonValue>(trimmed) {
            return match json {
                JsonValue::Object(map) => map
                    .get("token")
                    .and_then(JsonValue::as_str)
                    .map(str::trim)
                    .filter(|token| !token.is_empty())
                    .map(ToOwned::to_owned),
                JsonValue::String(inner) => {
                    let inner = inner.trim().to_owned();
                    (!inner.is_empty()).then_some(inner)
                }
                _ => None,
            };
        }

        if trimmed.contains('=') {
            return Self::token_from_query(trimmed);
        }

        Some(trimmed.to_owned())
    }

    fn token_from_query(query: &str) -> Option<String> {
        for pair in query.split('&') {
            let mut iter = pair.splitn(2, '=');
            let key = iter.next().unwrap_or_default();
            let value = iter.next().unwrap_or_default().trim();
            if key.eq_ignore_ascii_case("token") && !value.is_empty() {
                return Some(value.to_owned());
            }
        }
        None
    }
}

impl<A> ConnectMiddleware<A, ()> for SocketAuthMiddleware
where
    A: Adapter + 'static,
{
    fn call<'a>(
        &'a self,
        socket: Arc<socketioxide::socket::Socket<A>>,
        auth: &'a Option<Value>,
    ) -> impl futures_util::Future<
        Output = Result<(), Box<dyn std::fmt::Display + std::marker::Send + 'static>>,
    > + std::marker::Send {
        let state = self.state.clone();

        Box::pin(async move {
            let query = socket.req_parts().uri.query().map(ToOwned::to_owned);
            let token = Self::extract_token(auth.as_ref(), query.as_deref());

            let Some(token) = token else {
                let formatted = Self::format_error(AppError::unauthorized(
                    "connection token missing from handshake",
                ));
                return Err(Box::new(formatted) as Box<dyn std::fmt::Display + Send>);
            };

            let principal = match state.token_verifier.verify(&token).await {
                Ok(Some(principal)) => principal,
                Ok(None) => {
                    warn!("socket handshake presented an invalid or expired token");
                    let formatted = Self::format_error(AppError::unauthorized(
                        "invalid or expired connection token",
                    ));
                    return Err(Box::new(formatted) as Box<dyn std::fmt::Display + Send>);
                }
                Err(err) => {
                    let formatted = Self::format_error(AppError::from_anyhow(err));
                    return Err(Box::new(formatted) as Box<dyn std::fmt::Display + Send>);
                }
            };

            let socket_ref = socketioxide::extract::SocketRef::from(socket.clone());
            let user = SocketUserContext::new(principal);
            let socket_root_span = logfire::span!(
                "socket connection",
                socket_id = socket_ref.id.to_string(),
                user_id = user.user_id.as_str()
            );

            socket_root_span.in_scope(|| {
                info!(
                    socket_id = %socket_ref.id,
                    user_id = %user.user_id,
                    "socket authenticated"
                );
            });

            socket_ref.extensions.insert(user);
            socket_ref.extensions.insert(state.clone());
            socket_ref
                .extensions
                .insert(crate::socket::events::SocketRootSpan(socket_root_span));

            state.socket_metrics.inc_connections();

            Ok(())
        })
    }
}
