use super::validate_registry_id;
use crate::assembly::{self, EnrollmentDetails, EnrollmentSummary};
use crate::models::{EnrollmentKind, SymmetricKeyPair};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateEnrollmentRequest {
    #[validate(
        length(min = 1, max = 128, message = "Registration id must be 1-128 characters"),
        custom(function = "validate_registry_id")
    )]
    pub registration_id: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_edge: bool,
}

/// `?is_group=` selector shared by the per-enrollment routes.
#[derive(Debug, Default, Deserialize)]
pub struct KindQuery {
    #[serde(default)]
    pub is_group: bool,
}

impl KindQuery {
    fn kind(&self) -> EnrollmentKind {
        EnrollmentKind::from_is_group(self.is_group)
    }
}

#[tracing::instrument(skip(state))]
pub async fn list_enrollments(
    State(state): State<AppState>,
) -> Result<Json<Vec<EnrollmentSummary>>, AppError> {
    let enrollments = assembly::list_enrollments(state.provisioning.as_ref()).await?;
    Ok(Json(enrollments))
}

#[tracing::instrument(skip(state, request))]
pub async fn create_enrollment(
    State(state): State<AppState>,
    Json(request): Json<CreateEnrollmentRequest>,
) -> Result<(StatusCode, Json<EnrollmentDetails>), AppError> {
    request.validate()?;

    let kind = EnrollmentKind::from_is_group(request.is_group);
    let cancel = state.shutdown.child_token();
    let enrollment = state
        .orchestrator
        .create_enrollment(&request.registration_id, kind, request.is_edge, &cancel)
        .await?;

    tracing::info!(
        registration_id = %enrollment.registration_id,
        kind = %kind,
        "Enrollment created"
    );
    Ok((StatusCode::CREATED, Json(EnrollmentDetails::from(&enrollment))))
}

#[tracing::instrument(skip(state))]
pub async fn get_enrollment(
    State(state): State<AppState>,
    Path(registration_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> Result<Json<EnrollmentDetails>, AppError> {
    let details =
        assembly::get_enrollment(state.provisioning.as_ref(), &registration_id, query.kind())
            .await?;
    Ok(Json(details))
}

#[tracing::instrument(skip(state))]
pub async fn delete_enrollment(
    State(state): State<AppState>,
    Path(registration_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> Result<StatusCode, AppError> {
    let kind = query.kind();
    let cancel = state.shutdown.child_token();
    state
        .orchestrator
        .delete_enrollment(&registration_id, kind, &cancel)
        .await?;

    tracing::info!(registration_id = %registration_id, kind = %kind, "Enrollment deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
pub async fn get_attestation(
    State(state): State<AppState>,
    Path(registration_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> Result<Json<SymmetricKeyPair>, AppError> {
    let keys =
        assembly::get_attestation(state.provisioning.as_ref(), &registration_id, query.kind())
            .await?;
    Ok(Json(keys))
}
