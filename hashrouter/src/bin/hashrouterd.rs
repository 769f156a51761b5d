use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use hashrouter::config::Config;
use hashrouter::relay::Relay;
use hashrouter::tcp_server::TcpServer;
use hashrouter::tracing::{self, prelude::*};
use hashrouter::validator::{ShareValidators, ValidatorEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::load().context("loading configuration")?;
    let running = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (validators, mut events) = ShareValidators::new();
    let relay = Relay::connect(
        config.pool_destination()?,
        config.relay_config(),
        running.clone(),
    )
    .await
    .context("connecting to default pool")?;
    relay.attach_validators(validators);

    let events_token = running.clone();
    tracker.spawn(async move {
        loop {
            let event = tokio::select! {
                _ = events_token.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else { break };
            match event {
                ValidatorEvent::ContractClosed {
                    contract,
                    hashes_analyzed,
                    hash_limit,
                } => info!(contract = %contract, hashes_analyzed, hash_limit, "Contract fulfilled"),
            }
        }
    });

    let mut server =
        TcpServer::new(config.listen_addr.clone()).with_shutdown_grace(config.shutdown_grace());
    server.set_connection_handler(Arc::new(relay));
    let server_token = running.clone();
    let mut server_task = tracker.spawn(async move { server.run(server_token).await });
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    let server_result = tokio::select! {
        _ = sigint.recv() => None,
        _ = sigterm.recv() => None,
        result = &mut server_task => Some(result),
    };

    trace!("Shutting down.");
    running.cancel();

    // The server stopping on its own is fatal; a cancelled one is not.
    let server_result = match server_result {
        Some(result) => result,
        None => server_task.await,
    };
    match server_result? {
        Ok(()) | Err(hashrouter::Error::Cancelled) => {}
        Err(e) => {
            error!(error = %e, "Server failed");
            tracker.wait().await;
            return Err(e.into());
        }
    }

    tracker.wait().await;
    info!("Exiting.");
    Ok(())
}
