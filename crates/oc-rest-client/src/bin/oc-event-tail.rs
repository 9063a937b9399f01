//! Tail the server's event feed, reconnecting whenever the stream drops.
//!
//! Configuration comes from `OPENCODE_SERVER` and `OPENCODE_AUTH_TOKEN`; log
//! verbosity from `RUST_LOG`. Events go to stdout, logs to stderr.

use anyhow::Context;
use oc_rest_client::{CancellationToken, ClientConfig, EventStreamClient, RestClient, RestClientError};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LIVENESS_CHECK: Duration = Duration::from_secs(1);

async fn ensure_connected(stream: &EventStreamClient, shutdown: &CancellationToken) -> anyhow::Result<()> {
    if stream.is_connected() {
        return Ok(());
    }
    stream
        .reconnect(shutdown)
        .await
        .context("could not connect to the event feed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let client = RestClient::new(ClientConfig::from_env())
        .context("invalid client configuration")?
        .with_cancellation(shutdown.clone());
    match client.ping().await {
        Ok(()) => info!(url = %client.base_url(), "server is reachable"),
        Err(RestClientError::Cancelled) => return Ok(()),
        Err(e) => warn!(url = %client.base_url(), error = %e, "server health check failed"),
    }

    let stream = client.event_stream()?;
    let mut events = stream.events().context("event receiver already taken")?;
    let mut errors = stream.errors().context("error receiver already taken")?;

    let mut liveness = tokio::time::interval(LIVENESS_CHECK);
    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            Some(event) = events.recv() => println!("{}\t{}", event.event, event.data),
            Some(e) = errors.recv() => warn!(error = %e, "event stream interrupted"),
            _ = liveness.tick() => {
                if let Err(e) = ensure_connected(&stream, &shutdown).await {
                    if shutdown.is_cancelled() {
                        break Ok(());
                    }
                    break Err(e);
                }
            }
        }
    };

    stream.disconnect().await;
    info!("event tail stopped");
    result
}
