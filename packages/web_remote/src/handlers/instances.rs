use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use crate::AppState;
use crate::link::LinkStatus;
use crate::protocol::{InstanceRecord, Transport};

#[derive(Serialize)]
struct InstanceView {
    #[serde(flatten)]
    record: InstanceRecord,
    transport: Transport,
}

#[derive(Serialize)]
struct BrokerStatus {
    connected: bool,
}

#[derive(Serialize)]
struct InstancesResponse {
    version: u64,
    instances: Vec<InstanceView>,
    links: Vec<LinkStatus>,
    broker: Option<BrokerStatus>,
}

/// GET /api/instances - current presence table plus transport state
pub async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.hub.registry().snapshot().await;
    let instances = snapshot
        .records
        .into_iter()
        .map(|record| InstanceView {
            transport: record.transport,
            record,
        })
        .collect();

    Json(InstancesResponse {
        version: snapshot.version,
        instances,
        links: state.links.statuses().await,
        broker: state.broker.as_ref().map(|b| BrokerStatus {
            connected: b.is_connected(),
        }),
    })
}
