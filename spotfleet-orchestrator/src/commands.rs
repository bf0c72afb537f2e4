use futures_util::StreamExt;
use spotfleet_common::bus::{FleetCommand, CHANNEL_FLEET_COMMANDS};
use spotfleet_common::FleetError;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::store::PoolStore;

/// Apply one operator command.
pub async fn handle_command(
    command: FleetCommand,
    store: &dyn PoolStore,
    trigger: &Notify,
) -> Result<(), FleetError> {
    match command {
        FleetCommand::Reconcile => {
            info!("📥 received manual reconciliation command");
            trigger.notify_one();
        }
        FleetCommand::CyclePool { pool_id } => {
            info!(%pool_id, "📥 received cycle command");
            let pool = store.get_pool(pool_id).await?;
            let config = store.load_config(pool.config_id).await?;
            if config.cycle_interval().is_none() {
                return Err(FleetError::Config(format!(
                    "pool '{}' has cycling disabled (cycle_interval_secs = 0)",
                    pool.name
                )));
            }
            store.set_last_cycled(pool_id, None).await?;
            trigger.notify_one();
        }
    }
    Ok(())
}

/// Subscribe to `fleet_commands` and apply commands until the connection drops.
pub async fn listen(
    client: redis::Client,
    store: Arc<dyn PoolStore>,
    trigger: Arc<Notify>,
) -> anyhow::Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_FLEET_COMMANDS).await?;
    info!("🎧 listening on Redis channel '{}'", CHANNEL_FLEET_COMMANDS);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("unreadable command payload: {}", e);
                continue;
            }
        };
        match serde_json::from_str::<FleetCommand>(&payload) {
            Ok(command) => {
                if let Err(e) = handle_command(command, store.as_ref(), &trigger).await {
                    warn!("command failed: {}", e);
                }
            }
            Err(e) => warn!("⚠️  ignoring unknown command {}: {}", payload, e),
        }
    }
    warn!("command channel closed");
    Ok(())
}
