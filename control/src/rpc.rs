//! Synchronous request/response calls over a control connection.
//!
//! One call is in flight per connection at a time; `call` takes `&mut self`
//! so callers serialize naturally. Concurrent callers open their own
//! connections.

use crate::endpoint::{self, Connection};
use crate::error::ControlError;
use crate::protocol::{Greeting, RpcRequest, RpcResponse, wire_method};
use serde_json::Value;
use std::path::Path;
use uuid::Uuid;

pub struct RpcClient {
    conn: Connection,
    greeted: bool,
}

impl RpcClient {
    pub fn connect(path: &Path) -> Result<Self, ControlError> {
        Ok(Self::new(endpoint::connect(path)?))
    }

    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            greeted: false,
        }
    }

    /// Issue `method` with a single parameter mapping and return its result.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value, ControlError> {
        let id = Uuid::new_v4().to_string();
        let request = RpcRequest {
            method: wire_method(method),
            params: vec![params],
            id: Value::String(id.clone()),
        };

        self.send(&request)?;
        let response = self.receive()?;

        if response.id != request.id {
            return Err(ControlError::Protocol(format!(
                "response id mismatch: expected {}, got {} (raw response: {})",
                request.id,
                response.id,
                serde_json::to_string(&response).unwrap_or_default()
            )));
        }

        if let Some(error) = response.error {
            tracing::debug!(method = %request.method, error = %error, "Remote call failed");
            return Err(ControlError::Remote(error));
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    fn send(&mut self, request: &RpcRequest) -> Result<(), ControlError> {
        if !self.greeted {
            self.conn
                .write_line(Greeting::Rpc.line())
                .map_err(|e| ControlError::transport("write greeting", e))?;
            self.greeted = true;
        }
        tracing::trace!(method = %request.method, id = %request.id, "Sending RPC request");
        self.conn.send(request)
    }

    fn receive(&mut self) -> Result<RpcResponse, ControlError> {
        let line = self
            .conn
            .read_line()
            .map_err(|e| ControlError::transport("read response", e))?
            .ok_or_else(|| ControlError::transport("read response", "connection closed"))?;

        serde_json::from_str(&line)
            .map_err(|e| ControlError::Protocol(format!("malformed response {:?}: {}", line, e)))
    }
}
