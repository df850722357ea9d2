//! In-process device for integration tests.
//!
//! Serves WebSocket on 127.0.0.1 and answers every text frame through a
//! handler closure. Records request frames, handshake paths and the number of
//! accepted connections.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Marker reply key: the device closes the socket instead of sending it.
const HANG_UP: &str = "__hang_up";

/// Maps one request frame to the frames sent back, in order.
pub type Handler = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

pub struct MockDevice {
    pub host: String,
    requests: Arc<Mutex<Vec<Value>>>,
    paths: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicU32>,
}

impl MockDevice {
    pub async fn spawn(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let device = Self {
            host: format!("ws://{}", addr),
            requests: Arc::new(Mutex::new(Vec::new())),
            paths: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicU32::new(0)),
        };

        let requests = Arc::clone(&device.requests);
        let paths = Arc::clone(&device.paths);
        let connections = Arc::clone(&device.connections);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                let requests = Arc::clone(&requests);
                let paths = Arc::clone(&paths);
                let connections = Arc::clone(&connections);

                tokio::spawn(async move {
                    let record_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        paths.lock().unwrap().push(req.uri().path().to_string());
                        Ok(resp)
                    };
                    let Ok(mut ws) = accept_hdr_async(stream, record_path).await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);

                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let request: Value = serde_json::from_str(&text).unwrap();
                        requests.lock().unwrap().push(request.clone());
                        for reply in handler(&request) {
                            if reply.get(HANG_UP).is_some() {
                                let _ = ws.close(None).await;
                                return;
                            }
                            if ws.send(Message::Text(reply.to_string())).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        device
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.requests.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device never received the expected requests");
    }
}

/// `{"id", "result"}` answering `request`.
pub fn result_for(request: &Value, result: Value) -> Value {
    json!({"id": request["id"], "src": "shellypro1-8cb1", "dst": request["src"], "result": result})
}

/// `{"id", "error"}` answering `request`.
pub fn error_for(request: &Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "id": request["id"],
        "src": "shellypro1-8cb1",
        "dst": request["src"],
        "error": {"code": code, "message": message.into()}
    })
}

/// 401 carrying a challenge with `nonce` and `nc` in its message.
pub fn challenge_for(request: &Value, nonce: &str, realm: &str, nc: u64) -> Value {
    let challenge = json!({
        "auth_type": "digest",
        "nonce": nonce,
        "nc": nc,
        "realm": realm,
        "algorithm": "SHA-256"
    });
    error_for(request, 401, challenge.to_string())
}

/// Reply that makes the device close the connection at that point.
pub fn hang_up() -> Value {
    let mut reply = serde_json::Map::new();
    reply.insert(HANG_UP.to_string(), Value::Bool(true));
    Value::Object(reply)
}

/// A `ws://` address nothing is listening on.
pub async fn dead_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}", addr)
}
