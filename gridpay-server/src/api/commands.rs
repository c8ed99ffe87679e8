use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
};

use gridpay_core::{AccountId, Actor, CommandId, DeviceId};

use super::models::{
    parse_switch_command, parse_terminal_result, CommandRequest, CommandResponse,
    PendingCommandResponse, ResultAckResponse, ResultRequest,
};
use super::{engine_error_response, error_response, parse_ulid, success_response};
use crate::AppState;
use crate::store::{AlertStore, CommandStore, LedgerStore, MeterStore};

// Enqueue a breaker command for a device
pub async fn enqueue_command<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<CommandRequest>,
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

    let Some(command) = parse_switch_command(&payload.command) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid command, expected ON, OFF or TOGGLE".to_string(),
        );
    };

    let requested_by = match payload.requester_id.as_deref() {
        Some(raw) => match parse_ulid(raw) {
            Ok(ulid) => Actor::Admin(AccountId(ulid)),
            Err(response) => return response,
        },
        None => Actor::System,
    };

    match state
        .engine
        .enqueue_command(
            device_id,
            payload.coil_address,
            command,
            requested_by,
            payload.max_retries,
            payload.notes,
        )
        .await
    {
        Ok(enqueued) => success_response(
            StatusCode::CREATED,
            CommandResponse::from(enqueued),
            Some("breaker command enqueued".to_string()),
        ),
        Err(err) => engine_error_response(err),
    }
}

// Pending commands awaiting execution; polled by the worker
pub async fn pending_commands<M, L, A, C>(State(state): State<AppState<M, L, A, C>>) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    match state.engine.pending_commands().await {
        Ok(pending) => {
            let responses: Vec<PendingCommandResponse> = pending
                .into_iter()
                .map(PendingCommandResponse::from)
                .collect();
            success_response(StatusCode::OK, responses, None)
        }
        Err(err) => engine_error_response(err),
    }
}

// Count one execution attempt against a command's retry budget
pub async fn note_attempt<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let command_id = match parse_ulid(&id) {
        Ok(ulid) => CommandId(ulid),
        Err(response) => return response,
    };

    match state.engine.note_attempt(command_id).await {
        Ok(counted) => success_response(
            StatusCode::OK,
            serde_json::json!({ "command_id": id, "counted": counted }),
            None,
        ),
        Err(err) => engine_error_response(err),
    }
}

// Record the worker's terminal result for a command
pub async fn record_result<M, L, A, C>(
    Path(id): Path<String>,
    State(state): State<AppState<M, L, A, C>>,
    Json(payload): Json<ResultRequest>,
) -> Response
where
    M: MeterStore,
    L: LedgerStore,
    A: AlertStore,
    C: CommandStore,
{
    let command_id = match parse_ulid(&id) {
        Ok(ulid) => CommandId(ulid),
        Err(response) => return response,
    };

    let Some(result) = parse_terminal_result(&payload.result) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid result, expected SUCCESS, FAILED or TIMEOUT".to_string(),
        );
    };

    match state
        .engine
        .record_result(command_id, result, payload.error_message)
        .await
    {
        Ok(ack) => success_response(
            StatusCode::OK,
            ResultAckResponse {
                command_id: id,
                applied: ack.applied,
            },
            None,
        ),
        Err(err) => engine_error_response(err),
    }
}
