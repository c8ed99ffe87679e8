pub mod accounts;
pub mod commands;
pub mod devices;
pub mod models;
pub mod readings;
pub mod tariffs;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::str::FromStr;
use ulid::Ulid;

use crate::AppState;
use crate::engine::EngineError;
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};
use models::ApiResponse;

pub fn router<M, L, A, C>() -> Router<AppState<M, L, A, C>>
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    Router::new()
        // Reading ingestion (data-acquisition collaborator)
        .route("/readings", post(readings::ingest_reading))
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/{id}", get(accounts::account_overview))
        .route("/accounts/{id}/alerts", get(accounts::account_alerts))
        .route("/accounts/{id}/recharge", post(accounts::recharge_account))
        // Devices
        .route(
            "/devices",
            get(devices::list_devices).post(devices::create_device),
        )
        .route("/devices/{id}", get(devices::get_device))
        // Tariffs
        .route("/tariffs", post(tariffs::create_tariff))
        // Breaker command lifecycle (admin + worker collaborators)
        .route("/devices/{id}/commands", post(commands::enqueue_command))
        .route("/commands/pending", get(commands::pending_commands))
        .route("/commands/{id}/attempt", post(commands::note_attempt))
        .route("/commands/{id}/result", post(commands::record_result))
}

// Helper to create success response
pub(crate) fn success_response<T: serde::Serialize>(
    status: StatusCode,
    data: T,
    message: Option<String>,
) -> Response {
    let api_response = ApiResponse {
        success: true,
        data: Some(data),
        message,
    };
    (status, Json(api_response)).into_response()
}

// Helper to create error response
pub(crate) fn error_response(status: StatusCode, message: String) -> Response {
    let api_response = ApiResponse::<()> {
        success: false,
        data: None,
        message: Some(message),
    };
    (status, Json(api_response)).into_response()
}

/// Map typed engine failures onto HTTP statuses.
pub(crate) fn engine_error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::AccountNotFound(_)
        | EngineError::DeviceNotFound(_)
        | EngineError::CommandNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::DeviceDisabled(_) => StatusCode::CONFLICT,
        EngineError::InvalidRecharge => StatusCode::BAD_REQUEST,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Parse a ULID path or payload parameter.
pub(crate) fn parse_ulid(id: &str) -> Result<Ulid, Response> {
    Ulid::from_str(id).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid id '{id}', expected a ULID"),
        )
    })
}
