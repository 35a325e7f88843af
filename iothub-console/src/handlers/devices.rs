use super::validate_registry_id;
use crate::assembly::{self, DeviceInfo, DeviceSummary, ModuleSummary};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDeviceRequest {
    #[validate(
        length(min = 1, max = 128, message = "Device id must be 1-128 characters"),
        custom(function = "validate_registry_id")
    )]
    pub device_id: String,
    #[serde(default)]
    pub is_edge: bool,
}

#[tracing::instrument(skip(state))]
pub async fn list_devices(
    State(state): State<AppState>,
) -> Result<Json<Vec<DeviceSummary>>, AppError> {
    let devices = assembly::list_devices(state.registry.as_ref()).await?;
    Ok(Json(devices))
}

#[tracing::instrument(skip(state, request))]
pub async fn create_device(
    State(state): State<AppState>,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceSummary>), AppError> {
    request.validate()?;

    let cancel = state.shutdown.child_token();
    let device = state
        .orchestrator
        .create_device(&request.device_id, request.is_edge, &cancel)
        .await?;

    tracing::info!(device_id = %device.device_id, is_edge = request.is_edge, "Device created");
    Ok((
        StatusCode::CREATED,
        Json(DeviceSummary {
            device_id: device.device_id,
            status: Some(device.status),
            connection_state: Some(device.connection_state),
            is_edge: device.capabilities.iot_edge,
            model_id: device.model_id,
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceInfo>, AppError> {
    let info = assembly::device_info(state.registry.as_ref(), &device_id).await?;
    Ok(Json(info))
}

#[tracing::instrument(skip(state))]
pub async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let cancel = state.shutdown.child_token();
    state.orchestrator.delete_device(&device_id, &cancel).await?;

    tracing::info!(device_id = %device_id, "Device deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
pub async fn list_modules(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Vec<ModuleSummary>>, AppError> {
    let modules = assembly::list_modules(state.registry.as_ref(), &device_id).await?;
    Ok(Json(modules))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_validation() {
        let ok = CreateDeviceRequest {
            device_id: "edge-01".to_string(),
            is_edge: true,
        };
        assert!(ok.validate().is_ok());

        let empty = CreateDeviceRequest {
            device_id: String::new(),
            is_edge: false,
        };
        assert!(empty.validate().is_err());

        let too_long = CreateDeviceRequest {
            device_id: "d".repeat(129),
            is_edge: false,
        };
        assert!(too_long.validate().is_err());

        let bad_chars = CreateDeviceRequest {
            device_id: "dev 1".to_string(),
            is_edge: false,
        };
        assert!(bad_chars.validate().is_err());
    }
}
