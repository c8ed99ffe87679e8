use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use ulid::Ulid;

use gridpay_core::{AccountId, Connectivity, Device, DeviceId, DeviceState};

use super::models::{DeviceCreateRequest, DeviceOverviewResponse};
use super::{engine_error_response, error_response, parse_ulid, success_response};
use crate::AppState;
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

// Register a metering device
pub async fn create_device<M, L, A, C>(
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<DeviceCreateRequest>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let account_id = match parse_ulid(&payload.account_id) {
        Ok(ulid) => AccountId(ulid),
        Err(response) => return response,
    };

    let device = Device {
        id: DeviceId(Ulid::new()),
        account_id,
        serial: payload.serial.into_boxed_str(),
        address: payload.address.into_boxed_str(),
        unit_id: payload.unit_id.unwrap_or(1),
        state: DeviceState::Active,
        breaker_coil: payload.breaker_coil,
        breaker_enabled: payload.breaker_enabled,
        auto_disconnect: payload.auto_disconnect,
        last_breaker_state: None,
        connectivity: Connectivity::Unknown,
        last_seen: None,
        provisioned_at: jiff::Timestamp::now(),
    };
    let device_id = device.id;

    match state.engine.meters.add_device(device).await {
        Ok(()) => success_response(
            StatusCode::CREATED,
            serde_json::json!({ "device_id": device_id.0.to_string() }),
            Some("device created".to_string()),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create device: {e}"),
        ),
    }
}

// Connectivity / last-reading summaries for all devices
pub async fn list_devices<M, L, A, C>(State(state): State<AppState<M, L, A, C>>) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    match state.engine.device_overviews().await {
        Ok(overviews) => {
            let responses: Vec<DeviceOverviewResponse> = overviews
                .into_iter()
                .map(DeviceOverviewResponse::from)
                .collect();
            success_response(StatusCode::OK, responses, None)
        }
        Err(err) => engine_error_response(err),
    }
}

// Summary for one device
pub async fn get_device<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let device_id = match parse_ulid(&id) {
        Ok(ulid) => DeviceId(ulid),
        Err(response) => return response,
    };

    match state.engine.device_overview(device_id).await {
        Ok(overview) => {
            success_response(StatusCode::OK, DeviceOverviewResponse::from(overview), None)
        }
        Err(err) => engine_error_response(err),
    }
}
