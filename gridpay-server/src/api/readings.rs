use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use gridpay_core::DeviceId;

use super::models::{parse_quality, ApiResponse, IngestRequest, IngestResponse};
use super::{engine_error_response, parse_ulid, success_response};
use crate::engine::{IngestOutcome, IngestReading};
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};
use crate::AppState;

// Ingest one raw meter sample
pub async fn ingest_reading<M, L, A, C>(
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<IngestRequest>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let device_id = match parse_ulid(&payload.device_id) {
        Ok(id) => DeviceId(id),
        Err(response) => return response,
    };

    let sample = IngestReading {
        device_id,
        timestamp: payload.timestamp,
        energy_kwh: payload.energy_kwh,
        grid_kwh: payload.grid_kwh,
        generator_kwh: payload.generator_kwh,
        power_kw: payload.power_kw,
        voltage: payload.voltage,
        current: payload.current,
        frequency: payload.frequency,
        power_factor: payload.power_factor,
        quality: parse_quality(payload.quality.as_deref()),
    };

    match state.engine.ingest(sample).await {
        Ok(IngestOutcome::Accepted {
            reading_id,
            delta_kwh,
        }) => success_response(
            StatusCode::OK,
            IngestResponse {
                status: "accepted".to_string(),
                reading_id: Some(reading_id.0.to_string()),
                delta_kwh: Some(delta_kwh.into_inner()),
                reason: None,
            },
            None,
        ),
        Ok(IngestOutcome::Duplicate) => success_response(
            StatusCode::OK,
            IngestResponse {
                status: "duplicate".to_string(),
                reading_id: None,
                delta_kwh: None,
                reason: None,
            },
            Some("reading already ingested".to_string()),
        ),
        Ok(IngestOutcome::Rejected { reason }) => {
            let body = IngestResponse {
                status: "rejected".to_string(),
                reading_id: None,
                delta_kwh: None,
                reason: Some(reason.to_string()),
            };
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse {
                    success: false,
                    data: Some(body),
                    message: Some(format!("reading rejected: {reason}")),
                }),
            )
                .into_response()
        }
        Err(err) => engine_error_response(err),
    }
}
