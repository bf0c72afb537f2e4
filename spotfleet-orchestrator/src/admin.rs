use axum::http::StatusCode;
use axum::{
    extract::State,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use spotfleet_common::FleetError;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::ProvisioningTasks;
use crate::logger::RecentEvents;
use crate::store::PoolStore;

pub struct AdminState {
    pub store: Arc<dyn PoolStore>,
    pub recent: Arc<RecentEvents>,
    pub provisioning: Arc<ProvisioningTasks>,
}

/// Internal health/debug surface. Read-only.
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .with_state(state)
}

async fn root() -> &'static str {
    "SpotFleet Orchestrator Online"
}

async fn get_status(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match status_snapshot(&state).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

pub async fn status_snapshot(state: &AdminState) -> Result<Value, FleetError> {
    let pools = state.store.list_pools().await?;
    let mut instances_by_state: BTreeMap<&'static str, usize> = BTreeMap::new();
    for pool in &pools {
        for instance in state.store.list_instances(pool.id).await? {
            *instances_by_state.entry(instance.status.as_str()).or_default() += 1;
        }
    }

    Ok(json!({
        "pools": pools.len(),
        "instances": instances_by_state,
        "provisioning_in_flight": state.provisioning.in_flight(),
        "recent_events": state.recent.snapshot(),
    }))
}
