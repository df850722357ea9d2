//! Shelly RPC command line client
//!
//! Sends one RPC call to a device and prints the JSON result.
//!
//! ## Usage
//!
//! ```bash
//! # Unauthenticated device
//! shelly-rpc --host ws://192.168.1.20 Shelly.GetStatus
//!
//! # With parameters
//! shelly-rpc --host ws://192.168.1.20 Switch.Set '{"id":0,"on":true}'
//!
//! # Password protected (device id fetched automatically)
//! SHELLY_PASSWORD=secret shelly-rpc --host ws://192.168.1.20 Shelly.GetConfig
//!
//! # From a config file
//! shelly-rpc --config device.toml Shelly.GetStatus
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::Value;
use shelly_ws_transport::{RetryLimit, Sha256Hasher, Transport, TransportConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shelly-rpc")]
#[command(about = "Send a JSON-RPC call to a device over WebSocket")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device address (ws:// or wss://)
    #[arg(long, env = "SHELLY_HOST")]
    host: Option<String>,

    /// Client ID sent as `src`
    #[arg(long)]
    client_id: Option<String>,

    /// Reconnect attempts after unexpected closes (-1 = unlimited)
    #[arg(long, allow_negative_numbers = true)]
    max_retries: Option<i64>,

    /// Device ID used to derive credentials (fetched when omitted)
    #[arg(long)]
    device_id: Option<String>,

    /// Device password
    #[arg(long, env = "SHELLY_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Seconds to wait for each call
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// RPC method, e.g. Shelly.GetStatus
    method: String,

    /// Parameters as a JSON object
    params: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("shelly_ws_transport=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::default(),
    };

    // Apply CLI overrides
    if let Some(host) = args.host.clone() {
        config.host = host;
    }
    if let Some(client_id) = args.client_id.clone() {
        config.client_id = client_id;
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = RetryLimit::try_from(max_retries)?;
    }

    let params: Option<Value> = match &args.params {
        Some(raw) => Some(serde_json::from_str(raw).context("params must be valid JSON")?),
        None => None,
    };

    let transport = Transport::builder(config)
        .hasher(Arc::new(Sha256Hasher))
        .build()?;
    let timeout = Duration::from_secs(args.timeout_secs);

    info!(host = %transport.host(), "Connecting");
    transport.begin().await?;

    let outcome = run(&transport, &args, params, timeout).await;

    if let Err(e) = transport.end().await {
        warn!(error = %e, "Failed to close transport");
    }

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run(
    transport: &Transport,
    args: &Args,
    params: Option<Value>,
    timeout: Duration,
) -> anyhow::Result<Value> {
    if let Some(password) = &args.password {
        let device_id = match &args.device_id {
            Some(id) => id.clone(),
            None => fetch_device_id(transport, timeout).await?,
        };
        transport.authenticate(&device_id, password).await?;
        info!(device_id = %device_id, "Credentials configured");
    }

    let had_challenge = transport.has_challenge();
    match tokio::time::timeout(timeout, transport.rpc_request(&args.method, params.clone())).await
    {
        Ok(result) => return Ok(result?),
        Err(_) if !had_challenge && transport.has_challenge() => {
            info!(method = %args.method, "Device requested authentication, retrying");
        }
        Err(_) => bail!("{} timed out after {:?}", args.method, timeout),
    }

    if args.password.is_none() {
        bail!("device requires a password (--password or SHELLY_PASSWORD)");
    }

    match tokio::time::timeout(timeout, transport.rpc_request(&args.method, params)).await {
        Ok(result) => Ok(result?),
        Err(_) => bail!("{} timed out after {:?}", args.method, timeout),
    }
}

/// The device id is the realm of every challenge and is readable without credentials.
async fn fetch_device_id(transport: &Transport, timeout: Duration) -> anyhow::Result<String> {
    let info = tokio::time::timeout(timeout, transport.rpc_request("Shelly.GetDeviceInfo", None))
        .await
        .context("Shelly.GetDeviceInfo timed out")??;

    info.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("Shelly.GetDeviceInfo returned no id")
}
