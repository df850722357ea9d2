//! JSON-RPC Wire Protocol
//!
//! Single responsibility: Encode and decode frames in the device's JSON-RPC format.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! {
//!     "id": <u64>,            // Correlation ID
//!     "src": <string>,        // Client ID
//!     "method": <string>,
//!     "params": <object>,     // Optional
//!     "auth": {               // Only once a challenge is on file
//!         "realm", "username", "nonce", "cnonce", "response", "nc", "algorithm"
//!     }
//! }
//! ```
//!
//! ## Response
//! ```text
//! { "id": <u64>, "src": <string>, "dst": <string>, "result": <any> }
//! { "id": <u64>, "src": <string>, "dst": <string>, "error": { "code": <i64>, "message": <string> } }
//! ```
//!
//! ## Notification (no id)
//! ```text
//! { "src": <string>, "dst": <string>, "method": <string>, "params": <object> }
//! ```
//!
//! An authentication failure is an error with code 401 whose message is itself a
//! JSON document carrying the challenge:
//! ```text
//! {"auth_type":"digest","nonce":1625038762,"nc":1,"realm":"shellypro1-8cb1","algorithm":"SHA-256"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::error::TransportError;

/// Error code the device uses for an authentication failure.
pub const AUTH_FAILURE_CODE: i64 = 401;

/// An error object returned by the device.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcError {
    pub fn is_auth_failure(&self) -> bool {
        self.code == AUTH_FAILURE_CODE
    }

    /// Decode the digest challenge carried by a 401 error.
    pub fn challenge(&self) -> Result<Challenge, TransportError> {
        if !self.is_auth_failure() {
            return Err(TransportError::Protocol(format!(
                "Error code {} does not carry a challenge",
                self.code
            )));
        }
        serde_json::from_str(&self.message)
            .map_err(|e| TransportError::Protocol(format!("Malformed challenge: {}", e)))
    }
}

/// Server nonce, kept in whatever JSON form the device sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Nonce {
    Number(u64),
    Text(String),
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nonce::Number(n) => write!(f, "{}", n),
            Nonce::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Nonce {
    fn from(s: &str) -> Self {
        Nonce::Text(s.to_string())
    }
}

impl From<u64> for Nonce {
    fn from(n: u64) -> Self {
        Nonce::Number(n)
    }
}

/// Server-issued digest challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub nonce: Nonce,
    pub realm: String,
    #[serde(rename = "nc", alias = "nonceCount")]
    pub nonce_count: u64,
}

/// Credentials attached to an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthBlock {
    pub realm: String,
    #[serde(rename = "username")]
    pub role_name: String,
    pub nonce: Nonce,
    #[serde(rename = "cnonce")]
    pub client_nonce: u32,
    #[serde(rename = "response")]
    pub proof: String,
    #[serde(rename = "nc")]
    pub nonce_count: u64,
    pub algorithm: String,
}

/// An outgoing request frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    pub id: u64,
    pub src: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthBlock>,
}

impl RpcRequest {
    pub fn encode(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// An unsolicited frame from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub src: Option<String>,
    pub method: String,
    pub params: Value,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    Notification(Notification),
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<u64>,
    src: Option<String>,
    method: Option<String>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Decode one inbound text frame.
pub fn decode_inbound(raw: &str) -> Result<Inbound, TransportError> {
    let frame: RawFrame = serde_json::from_str(raw)?;

    match (frame.id, frame.method) {
        (Some(id), _) => {
            let result = match frame.error {
                Some(error) => Err(error),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            Ok(Inbound::Response { id, result })
        }
        (None, Some(method)) => Ok(Inbound::Notification(Notification {
            src: frame.src,
            method,
            params: frame.params.unwrap_or(Value::Null),
        })),
        (None, None) => Err(TransportError::Protocol(
            "Frame has neither id nor method".into(),
        )),
    }
}
