//! Moonraker client implementations over the JSON-RPC websocket channel

pub mod protocol;
pub mod websocket_client;

pub use protocol::{ConnectionStats, InboundMessage, Notification, RpcError, RpcRequest};
pub use websocket_client::{MoonrakerClient, NotificationSubscription};

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Path every Moonraker websocket endpoint is served under
pub const WEBSOCKET_PATH_SUFFIX: &str = "/websocket";

/// Lifecycle state of the duplex channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Disconnected => write!(f, "disconnected"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Connected => write!(f, "connected"),
            ChannelState::Error => write!(f, "error"),
        }
    }
}

/// Anything that can issue a JSON-RPC call and wait for its outcome.
///
/// Discovery, subscription, command emitters and the boundary services are
/// written against this trait so they can run against [`MoonrakerClient`]
/// or a scripted mock.
#[async_trait]
pub trait RpcSender: Send + Sync {
    /// Send `method` with `params` and wait for the matching response
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

#[async_trait]
impl<T: RpcSender + ?Sized> RpcSender for Arc<T> {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        (**self).call(method, params).await
    }
}

/// Normalize a user supplied address to the websocket endpoint URL.
///
/// Bare hosts get `ws://`, `http`/`https` become `ws`/`wss`, and the path
/// always ends in `/websocket`.
pub fn normalize_address(address: &str) -> Result<Url> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(SyncError::invalid_input("Empty server address"));
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };

    let mut url = Url::parse(&with_scheme)?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| SyncError::connection("Failed to convert HTTP to WebSocket URL"))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| SyncError::connection("Failed to convert HTTPS to WebSocket URL"))?,
        other => {
            return Err(SyncError::connection(format!(
                "Unsupported URL scheme for WebSocket: {other}"
            )))
        }
    }

    let path = url.path().trim_end_matches('/').to_string();
    if path.ends_with(WEBSOCKET_PATH_SUFFIX) {
        url.set_path(&path);
    } else {
        url.set_path(&format!("{path}{WEBSOCKET_PATH_SUFFIX}"));
    }

    Ok(url)
}
