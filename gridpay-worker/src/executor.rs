use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::driver::BreakerDriver;

/// Receiver for per-attempt retry accounting.
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn note_attempt(&self, command_id: &str);
}

/// Everything needed to drive one relay write.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command_id: String,
    pub address: String,
    pub unit_id: u8,
    pub coil: u16,
    pub target_state: bool,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Success,
    Failed,
    Timeout,
}

impl TerminalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalKind::Success => "SUCCESS",
            TerminalKind::Failed => "FAILED",
            TerminalKind::Timeout => "TIMEOUT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: TerminalKind,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Execute one command against the physical relay.
///
/// Up to `max_retries` write attempts with a fixed delay in between. A
/// read-back that does not match the target fails the command without
/// further retries: the relay accepted the write but did not move, so
/// repeating it will not help. An elapsed deadline reports TIMEOUT and
/// leaves any re-enqueue decision to the operator.
pub async fn execute<D, S>(
    driver: &D,
    sink: &S,
    spec: &CommandSpec,
    write_timeout: Duration,
    retry_delay: Duration,
) -> ExecutionOutcome
where
    D: BreakerDriver,
    S: AttemptSink,
{
    let budget = spec.max_retries.max(1);
    let mut last_error: Option<String> = None;

    for attempt in 1..=budget {
        sink.note_attempt(&spec.command_id).await;
        info!(
            command_id = %spec.command_id,
            address = %spec.address,
            coil = spec.coil,
            target = spec.target_state,
            attempt,
            "executing breaker write"
        );

        match tokio::time::timeout(
            write_timeout,
            driver.set_breaker(&spec.address, spec.unit_id, spec.coil, spec.target_state),
        )
        .await
        {
            Err(_) => {
                warn!(command_id = %spec.command_id, "write deadline elapsed");
                return ExecutionOutcome {
                    result: TerminalKind::Timeout,
                    error: Some(format!(
                        "no response from {} within {}s",
                        spec.address,
                        write_timeout.as_secs()
                    )),
                    attempts: attempt,
                };
            }
            Ok(Ok(read_back)) if read_back == spec.target_state => {
                return ExecutionOutcome {
                    result: TerminalKind::Success,
                    error: None,
                    attempts: attempt,
                };
            }
            Ok(Ok(read_back)) => {
                warn!(
                    command_id = %spec.command_id,
                    read_back,
                    expected = spec.target_state,
                    "read-back mismatch"
                );
                return ExecutionOutcome {
                    result: TerminalKind::Failed,
                    error: Some(format!(
                        "readback_mismatch: got {read_back}, expected {}",
                        spec.target_state
                    )),
                    attempts: attempt,
                };
            }
            Ok(Err(e)) => {
                warn!(command_id = %spec.command_id, attempt, error = %e, "write attempt failed");
                last_error = Some(e.to_string());
            }
        }

        if attempt < budget {
            tokio::time::sleep(retry_delay).await;
        }
    }

    ExecutionOutcome {
        result: TerminalKind::Failed,
        error: last_error.or_else(|| Some("unknown_error".to_string())),
        attempts: budget,
    }
}
