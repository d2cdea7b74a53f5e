//! Mock implementations for testing
//!
//! [`MockRpc`] answers calls from a per-method script and records every
//! call it receives, so discovery, subscription, command and service code
//! can be exercised without a socket.

use crate::client::RpcSender;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Reply {
    Result(Value),
    Remote { code: i64, message: String },
    NotConnected,
}

/// Scripted RPC sender
#[derive(Debug, Default)]
pub struct MockRpc {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockRpc {
    /// Create a mock that answers every unscripted method with `"ok"`
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `method` with `result`
    pub fn respond(&self, method: &str, result: Value) {
        self.script(method, Reply::Result(result));
    }

    /// Answer `method` with a remote error object
    pub fn fail(&self, method: &str, code: i64, message: &str) {
        self.script(
            method,
            Reply::Remote {
                code,
                message: message.to_string(),
            },
        );
    }

    /// Fail `method` as if no channel were open
    pub fn disconnect(&self, method: &str) {
        self.script(method, Reply::NotConnected);
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Params of every call to `method`, in order
    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }

    /// Scripts sent through `printer.gcode.script`, in order
    pub fn scripts(&self) -> Vec<String> {
        self.calls_for("printer.gcode.script")
            .iter()
            .filter_map(|params| params.get("script").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    fn script(&self, method: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(method.to_string(), reply);
    }
}

#[async_trait]
impl RpcSender for MockRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((method.to_string(), params));

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .cloned();

        match reply {
            Some(Reply::Result(value)) => Ok(value),
            Some(Reply::Remote { code, message }) => Err(SyncError::remote(code, message)),
            Some(Reply::NotConnected) => Err(SyncError::NotConnected),
            None => Ok(Value::String("ok".to_string())),
        }
    }
}
