use crate::services::azure::resource_name;
use crate::startup::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HubInfo {
    pub host_name: String,
    pub hub_name: String,
}

pub async fn hub_info(State(state): State<AppState>) -> Json<HubInfo> {
    let host_name = state.registry.host_name();
    Json(HubInfo {
        host_name: host_name.to_string(),
        hub_name: resource_name(host_name).to_string(),
    })
}
