//! Seam Runtime
//!
//! Boots a local mesh from settings and serves handoff requests read as JSON
//! lines from stdin, one response per line on stdout, until stdin closes or
//! Ctrl-C.

use anyhow::{Context, Result};
use seam_net::channel::{ChannelHandle, LocalBroker, Notification};
use seam_net::handoff::{
    HandoffConfig, HandoffCoordinator, HandoffResponse, PrepareToReceivePlayer,
};
use seam_net::{
    CellOwnershipRegistry, HandoffRequest, MapInstanceId, TenantId, WorldServerId,
    WorldServerRegistry,
};
use seam_services::Settings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One stdin line: the tenant the caller authenticated as, plus the request.
#[derive(Debug, Deserialize)]
struct InboundHandoff {
    #[serde(rename = "tenantID", default)]
    tenant_id: Option<TenantId>,
    #[serde(flatten)]
    request: HandoffRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundHandoff {
    status: u16,
    #[serde(flatten)]
    response: HandoffResponse,
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => {
            Settings::load(&path).with_context(|| format!("loading settings from {path}"))?
        }
        None => Settings::default(),
    };
    seam_services::init_tracing(&settings.log_filter)?;

    tracing::info!("Seam v{}", seam_core::VERSION);

    let servers = Arc::new(WorldServerRegistry::new());
    let cells = Arc::new(CellOwnershipRegistry::new(Arc::clone(&servers)));

    let mut ids = Vec::with_capacity(settings.bootstrap.servers.len());
    for server in &settings.bootstrap.servers {
        let id = servers
            .register(server.descriptor())
            .with_context(|| format!("registering world server {}", server.internal_address))?;
        ids.push(id);
    }
    for cell in &settings.bootstrap.cells {
        let owner = ids
            .get(cell.server)
            .copied()
            .with_context(|| {
                format!("cell {} refers to unknown server #{}", cell.cell, cell.server)
            })?;
        cells.assign(cell.cell.clone(), owner, MapInstanceId(cell.map_instance));
    }
    tracing::info!(servers = servers.len(), cells = cells.len(), "mesh bootstrapped");

    let config = HandoffConfig::from(&settings);
    let channel = ChannelHandle::connect(LocalBroker::new()).await;
    let health = channel.spawn_health_monitor((&settings.channel).into());

    let heartbeat_every = (settings.heartbeat_timeout() / 3).max(Duration::from_millis(100));
    let mut consumers = Vec::with_capacity(ids.len());
    for &id in &ids {
        let queue = channel.channel().bind(&config.routing_key(id))?;
        consumers.push(tokio::spawn(run_world_server(
            id,
            Arc::clone(&servers),
            queue,
            heartbeat_every,
        )));
    }

    let coordinator = Arc::new(HandoffCoordinator::new(Arc::clone(&cells), channel, config));
    let reaper = coordinator.spawn_session_reaper(settings.reaper_interval());

    let liveness = {
        let servers = Arc::clone(&servers);
        let timeout = settings.heartbeat_timeout();
        let mut ticker = tokio::time::interval(settings.liveness_sweep_interval());
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                servers.sweep_liveness(Instant::now(), timeout);
            }
        })
    };

    tracing::info!("ready; reading handoff requests from stdin");
    tokio::select! {
        result = serve_stdin(Arc::clone(&coordinator)) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
    }

    reaper.abort();
    liveness.abort();
    health.abort();
    for consumer in consumers {
        consumer.abort();
    }
    tracing::info!("Seam stopped");
    Ok(())
}

/// Stand-in for a world-server process: keeps heartbeating and logs every
/// prepare-to-receive notification addressed to it.
async fn run_world_server(
    id: WorldServerId,
    servers: Arc<WorldServerRegistry>,
    mut queue: mpsc::UnboundedReceiver<Notification>,
    heartbeat_every: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(err) = servers.heartbeat(id) {
                    tracing::warn!(server = %id, error = %err, "heartbeat rejected; stopping");
                    return;
                }
            }
            notification = queue.recv() => {
                let Some(notification) = notification else { return };
                match notification.payload::<PrepareToReceivePlayer>() {
                    Ok(prepare) => tracing::info!(
                        server = %id,
                        player = %prepare.player_session_id,
                        character = %prepare.character_name,
                        source = %prepare.source_rpc_endpoint,
                        target_cell = %prepare.target_cell_id,
                        "preparing to receive player"
                    ),
                    Err(err) => {
                        tracing::warn!(server = %id, error = %err, "unreadable notification")
                    }
                }
            }
        }
    }
}

async fn serve_stdin(coordinator: Arc<HandoffCoordinator<LocalBroker>>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let outbound = match serde_json::from_str::<InboundHandoff>(&line) {
            Ok(inbound) => {
                let result = coordinator.request_handoff(inbound.tenant_id, inbound.request).await;
                OutboundHandoff {
                    status: result.as_ref().map_or_else(|err| err.status_code(), |_| 200),
                    response: HandoffResponse::from(&result),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed handoff request");
                OutboundHandoff {
                    status: 400,
                    response: HandoffResponse {
                        can_proceed: false,
                        target_server_rpc_endpoint: None,
                        error_message: Some(format!("invalid request parameters: {err}")),
                    },
                }
            }
        };

        let mut out = serde_json::to_vec(&outbound)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }
    Ok(())
}
