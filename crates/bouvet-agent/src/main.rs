//! bouvet-agent: Guest agent for bouvet microVMs.
//!
//! Negotiates a control channel with the host (vsock, or virtio-serial
//! multiplexed with yamux) and serves newline-delimited JSON-RPC requests
//! for device attachment and network configuration on every logical stream
//! the host opens.

mod handler;
mod protocol;

use bouvet_guest::{AgentConfig, Channel, ChannelStream, DeviceRegistry, Sandbox};
use handler::{handle_request, Agent};
use protocol::{error_codes, Request, Response};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::signal::unix::SignalKind;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env();

    // Logs go to stderr; RUST_LOG wins over BOUVET_AGENT_LOG
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("bouvet-agent starting...");
    config.validate()?;
    debug!(?config, "configuration loaded");

    let agent = Arc::new(Agent::new(
        Sandbox::connect(&config)?,
        DeviceRegistry::with_defaults(&config),
    ));

    let mut channel = Channel::negotiate(&config)?;
    channel.setup()?;
    info!(channel = channel.kind(), "waiting for host");
    tokio::task::block_in_place(|| channel.wait())?;

    channel.listen()?;
    info!(channel = channel.kind(), "listening for connections");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = channel.accept() => match accepted {
                Ok(stream) => {
                    debug!("accepted new connection");
                    let agent = agent.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &agent).await {
                            warn!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionAborted => {
                    error!(error = %e, "control channel closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            },
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                info!("received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    channel.teardown()?;
    info!("agent shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        result = signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Handle a single logical stream.
///
/// Reads newline-delimited JSON-RPC requests and writes responses.
async fn handle_connection(stream: ChannelStream, agent: &Agent) -> anyhow::Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            debug!("client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!(request = %trimmed, "received request");

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => handle_request(agent, req).await,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {}", e))
            }
        };

        let json = serde_json::to_string(&response)?;
        debug!(response = %json, "sending response");
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}
