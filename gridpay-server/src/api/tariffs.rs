use axum::{Json, extract::State, http::StatusCode, response::Response};
use ordered_float::NotNan;
use ulid::Ulid;

use gridpay_core::{Tariff, TariffId};

use super::models::TariffCreateRequest;
use super::{error_response, success_response};
use crate::AppState;
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

// Create a tariff
pub async fn create_tariff<M, L, A, C>(
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<TariffCreateRequest>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let (Ok(grid_rate), Ok(generator_rate)) = (
        NotNan::new(payload.grid_rate),
        NotNan::new(payload.generator_rate),
    ) else {
        return error_response(StatusCode::BAD_REQUEST, "rates must be numbers".to_string());
    };
    if grid_rate.into_inner() < 0.0 || generator_rate.into_inner() < 0.0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "rates must not be negative".to_string(),
        );
    }

    let effective_from = payload.effective_from.unwrap_or_else(jiff::Timestamp::now);
    if let Some(effective_to) = payload.effective_to
        && effective_to <= effective_from
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            "effective_to must be after effective_from".to_string(),
        );
    }

    let tariff = Tariff {
        id: TariffId(Ulid::new()),
        name: payload.name.into_boxed_str(),
        grid_rate,
        generator_rate,
        active: payload.active,
        effective_from,
        effective_to: payload.effective_to,
    };
    let tariff_id = tariff.id;

    match state.engine.ledger.add_tariff(tariff).await {
        Ok(()) => success_response(
            StatusCode::CREATED,
            serde_json::json!({ "tariff_id": tariff_id.0.to_string() }),
            Some("tariff created".to_string()),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create tariff: {e}"),
        ),
    }
}
