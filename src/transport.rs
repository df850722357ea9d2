//! Authenticating Device Transport
//!
//! Single responsibility: Put the pieces together and apply authentication to
//! every outbound call.
//!
//! ```text
//! caller ──► Transport::rpc_request ──► AuthHandler (auth block, nc++)
//!                   │                          ▲
//!                   ▼                          │ 401 challenge
//!              RpcEngine ──► ConnectionManager ──► device /rpc
//! ```
//!
//! # Authentication
//!
//! Calls go out without an auth block until the device answers one of them
//! with a 401 challenge. From then on every call carries a proof built from
//! the current nonce count, and the count advances by one per call.
//!
//! The call that received the 401 is never resolved. Application code that
//! wants it answered re-issues it once [`Transport::has_challenge`] reports a
//! captured challenge.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::auth::{AuthHandler, DigestHasher};
use crate::config::TransportConfig;
use crate::connection::{rpc_url, ConnectionManager, ConnectionState, Connector, WsConnector};
use crate::error::TransportError;
use crate::lifecycle::{Lifecycle, LifecyclePhase, StartHandle};
use crate::rpc::{AuthBlock, Challenge, FrameReceiver, Notification, RpcEngine};

/// Builds a [`Transport`] from a config plus the pieces that cannot be serialized.
pub struct TransportBuilder {
    config: TransportConfig,
    hasher: Option<Arc<dyn DigestHasher>>,
    connector: Option<Arc<dyn Connector>>,
    client_nonce: Option<u32>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            hasher: None,
            connector: None,
            client_nonce: None,
        }
    }

    /// Hash capability used for the user token and every proof.
    pub fn hasher(mut self, hasher: Arc<dyn DigestHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Replace the tokio-tungstenite connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Fix the client nonce instead of drawing a random one.
    pub fn client_nonce(mut self, client_nonce: u32) -> Self {
        self.client_nonce = Some(client_nonce);
        self
    }

    /// # Errors
    /// `InvalidHost` unless the host is a `ws://` or `wss://` URL.
    pub fn build(self) -> Result<Transport, TransportError> {
        self.config.validate()?;

        let engine = Arc::new(RpcEngine::new(
            self.config.client_id.clone(),
            self.config.request_timeout(),
        ));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector));
        let receiver: Arc<dyn FrameReceiver> = engine.clone();
        let manager = Arc::new(ConnectionManager::new(
            rpc_url(&self.config.host),
            self.config.policy(),
            connector,
            receiver,
        ));

        let auth = match self.client_nonce {
            Some(nonce) => AuthHandler::with_client_nonce(self.hasher, nonce),
            None => AuthHandler::new(self.hasher),
        };

        info!(
            host = %self.config.host,
            client_id = %self.config.client_id,
            max_retries = %self.config.max_retries,
            "Transport created"
        );

        Ok(Transport {
            lifecycle: Lifecycle::new(self.config.host.clone(), manager),
            engine,
            auth,
            config: self.config,
        })
    }
}

/// A resilient, authenticating RPC transport to one device.
pub struct Transport {
    config: TransportConfig,
    engine: Arc<RpcEngine>,
    lifecycle: Lifecycle<ConnectionManager>,
    auth: AuthHandler,
}

impl Transport {
    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder::new(config)
    }

    pub fn host(&self) -> &str {
        self.lifecycle.host()
    }

    pub fn client_id(&self) -> &str {
        self.engine.client_id()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open the connection, or join the attempt already under way.
    pub fn begin(&self) -> StartHandle {
        self.lifecycle.begin()
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Requests still waiting for a response fail with `Disconnected`.
    ///
    /// # Errors
    /// `Usage` if the transport was not started.
    pub async fn end(&self) -> Result<(), TransportError> {
        self.lifecycle.end().await?;
        self.engine.fail_pending();
        Ok(())
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.hooks().state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.hooks().subscribe_state()
    }

    /// Unsolicited notifications from the device.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.engine.subscribe()
    }

    /// Store credentials for `device_id`.
    ///
    /// # Errors
    /// `MissingHashFunction` if the transport was built without a hasher.
    pub async fn authenticate(&self, device_id: &str, password: &str) -> Result<(), TransportError> {
        self.auth.authenticate(device_id, password).await
    }

    pub fn has_challenge(&self) -> bool {
        self.auth.has_challenge()
    }

    pub fn challenge(&self) -> Option<Challenge> {
        self.auth.challenge()
    }

    pub fn client_nonce(&self) -> u32 {
        self.auth.client_nonce()
    }

    /// Issue one RPC call.
    ///
    /// Once a challenge is on file the call carries an auth block. A 401
    /// answer with a challenge updates the stored challenge and leaves this
    /// call pending forever; callers that need an answer should race it
    /// against a timeout.
    pub async fn rpc_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        let (auth, result) = match self.prepare_auth().await {
            Ok(auth) => {
                let result = self
                    .engine
                    .request(
                        self.lifecycle.hooks().as_ref(),
                        method,
                        params.clone(),
                        auth.clone(),
                    )
                    .await;
                (auth, result)
            }
            Err(e) => (None, Err(e)),
        };

        match result {
            Ok(value) => Ok(value),
            Err(TransportError::Rpc(e)) if e.is_auth_failure() => {
                match e.challenge() {
                    Ok(challenge) => {
                        info!(
                            method = %method,
                            realm = %challenge.realm,
                            "Authentication required, challenge captured"
                        );
                        self.auth.capture_challenge(challenge);
                    }
                    Err(parse_error) => {
                        warn!(
                            method = %method,
                            error = %parse_error,
                            "Ignoring malformed authentication challenge"
                        );
                    }
                }
                std::future::pending().await
            }
            Err(e) => {
                error!(
                    method = %method,
                    params = ?params,
                    auth = ?auth.as_ref().map(redacted),
                    error = %e,
                    "RPC request failed"
                );
                Err(e)
            }
        }
    }

    /// Auth block for the next call, advancing the nonce count, or `None`
    /// while no challenge is on file.
    async fn prepare_auth(&self) -> Result<Option<AuthBlock>, TransportError> {
        match self.auth.next_nonce_count() {
            Some(nonce_count) => Ok(Some(self.auth.regenerate_auth_block(nonce_count).await?)),
            None => Ok(None),
        }
    }

    /// Typed wrapper around [`rpc_request`](Self::rpc_request).
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, TransportError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            value => Some(value),
        };
        let result = self.rpc_request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Auth block fields worth logging; the proof itself is left out.
fn redacted(auth: &AuthBlock) -> String {
    format!(
        "realm={} nonce={} nc={} cnonce={}",
        auth.realm, auth.nonce, auth.nonce_count, auth.client_nonce
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Sha256Hasher;
    use crate::rpc::Nonce;
    use serde_json::json;
    use std::io;
    use std::sync::Mutex;

    /// Collects formatted log lines for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_build_rejects_bad_host() {
        let result = Transport::builder(TransportConfig::for_host("http://device")).build();
        assert!(matches!(result, Err(TransportError::InvalidHost(_))));
    }

    #[tokio::test]
    async fn test_identity_is_exposed() {
        let transport = Transport::builder(TransportConfig {
            client_id: "kitchen".into(),
            ..TransportConfig::for_host("ws://10.0.0.9/")
        })
        .build()
        .unwrap();

        assert_eq!(transport.host(), "ws://10.0.0.9/");
        assert_eq!(transport.client_id(), "kitchen");
        assert_eq!(transport.phase(), LifecyclePhase::Idle);
        assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_authenticate_requires_hasher() {
        let transport = Transport::builder(TransportConfig::default()).build().unwrap();
        assert_eq!(
            transport.authenticate("shellypro1-8cb1", "secret").await,
            Err(TransportError::MissingHashFunction)
        );

        let transport = Transport::builder(TransportConfig::default())
            .hasher(Arc::new(Sha256Hasher))
            .build()
            .unwrap();
        transport.authenticate("shellypro1-8cb1", "secret").await.unwrap();
    }

    #[tokio::test]
    async fn test_request_before_begin_is_not_connected() {
        let transport = Transport::builder(TransportConfig::default()).build().unwrap();
        let result = transport.rpc_request("Shelly.GetStatus", None).await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[test]
    fn test_redacted_omits_proof() {
        let block = AuthBlock {
            realm: "shellypro1-8cb1".into(),
            role_name: "admin".into(),
            nonce: Nonce::Number(42),
            client_nonce: 7,
            proof: "deadbeef".into(),
            nonce_count: 3,
            algorithm: "SHA-256".into(),
        };
        let line = redacted(&block);
        assert!(line.contains("nc=3"));
        assert!(!line.contains("deadbeef"));
    }

    #[tokio::test]
    async fn test_auth_block_failure_is_logged_with_context() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let transport = Transport::builder(TransportConfig::default())
            .hasher(Arc::new(Sha256Hasher))
            .build()
            .unwrap();
        transport.auth.capture_challenge(Challenge {
            nonce: Nonce::from("N1"),
            realm: "shellypro1-8cb1".into(),
            nonce_count: 1,
        });

        let result = transport
            .rpc_request("Switch.Set", Some(json!({"id": 0})))
            .await;
        assert_eq!(result, Err(TransportError::MissingCredentials));

        let output = logs.contents();
        assert!(output.contains("RPC request failed"), "logs:\n{}", output);
        assert!(output.contains("method=Switch.Set"), "logs:\n{}", output);
    }
}
