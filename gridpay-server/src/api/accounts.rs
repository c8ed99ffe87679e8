use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};
use ordered_float::NotNan;
use ulid::Ulid;

use gridpay_core::{Account, AccountId, Actor};

use super::models::{
    AccountCreateRequest, AccountOverviewResponse, AlertResponse, RechargeRequest,
    RechargeResponse,
};
use super::{engine_error_response, error_response, parse_ulid, success_response};
use crate::AppState;
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

// Create a prepaid account
pub async fn create_account<M, L, A, C>(
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<AccountCreateRequest>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let Ok(allocated) = NotNan::new(payload.allocated_kwh) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "allocated_kwh must be a number".to_string(),
        );
    };
    if allocated.into_inner() < 0.0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "allocated_kwh must not be negative".to_string(),
        );
    }

    let account = Account {
        id: AccountId(Ulid::new()),
        name: payload.name.into_boxed_str(),
        allocated_kwh: allocated,
        used_kwh: NotNan::default(),
        active: true,
        locked: false,
        provisioned_at: jiff::Timestamp::now(),
    };
    let account_id = account.id;

    match state.engine.ledger.add_account(account).await {
        Ok(()) => success_response(
            StatusCode::CREATED,
            serde_json::json!({ "account_id": account_id.0.to_string() }),
            Some("account created".to_string()),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create account: {e}"),
        ),
    }
}

// Balance / status projection for one account
pub async fn account_overview<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let account_id = match parse_ulid(&id) {
        Ok(ulid) => AccountId(ulid),
        Err(response) => return response,
    };

    match state.engine.account_overview(account_id).await {
        Ok(overview) => success_response(
            StatusCode::OK,
            AccountOverviewResponse::from(overview),
            None,
        ),
        Err(err) => engine_error_response(err),
    }
}

// Open alerts for one account
pub async fn account_alerts<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let account_id = match parse_ulid(&id) {
        Ok(ulid) => AccountId(ulid),
        Err(response) => return response,
    };

    match state.engine.open_alerts(account_id).await {
        Ok(alerts) => {
            let responses: Vec<AlertResponse> =
                alerts.into_iter().map(AlertResponse::from).collect();
            success_response(StatusCode::OK, responses, None)
        }
        Err(err) => engine_error_response(err),
    }
}

// Recharge an account's allocation
pub async fn recharge_account<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<RechargeRequest>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let account_id = match parse_ulid(&id) {
        Ok(ulid) => AccountId(ulid),
        Err(response) => return response,
    };

    let approver = match payload.approver_id.as_deref() {
        Some(raw) => match parse_ulid(raw) {
            Ok(ulid) => Actor::Admin(AccountId(ulid)),
            Err(response) => return response,
        },
        None => Actor::System,
    };

    match state
        .engine
        .recharge(account_id, payload.amount_kwh, approver, payload.reference)
        .await
    {
        Ok(recharged) => success_response(
            StatusCode::OK,
            RechargeResponse::from(recharged),
            Some("recharge applied".to_string()),
        ),
        Err(err) => engine_error_response(err),
    }
}
