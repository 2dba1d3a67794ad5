//! Continuation executor.
//!
//! Runs exactly one step of flow logic: from a resume value to the next
//! request, a result, or an error. It performs no I/O and never blocks.

use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use super::{FlowContext, FlowLogic, Step};
use crate::errors::FlowException;
use crate::models::io_request::{FlowIORequest, Resume};
use crate::models::message::Payload;

/// Result of one executor step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The flow parked on a new request.
    Suspended(FlowIORequest),
    /// The flow returned a value.
    Completed(Payload),
    /// The flow raised, panicked, or asked for something it does not own.
    Failed(FlowException),
}

/// Run `logic` from `input` until it yields, returns, or fails.
pub fn run_step(logic: &mut dyn FlowLogic, ctx: &mut FlowContext<'_>, input: Resume) -> StepOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| logic.resume(ctx, input)));

    match result {
        Ok(Ok(Step::Suspend(request))) => match request.session_id() {
            Some(session_id) if !ctx.sessions.contains(session_id) => {
                warn!(flow_id = %ctx.flow_id, %session_id, request = request.kind(), "request names a session the flow does not own");
                StepOutcome::Failed(FlowException::InvalidSession {
                    session_id: session_id.to_string(),
                })
            }
            _ => StepOutcome::Suspended(request),
        },
        Ok(Ok(Step::Complete(result))) => StepOutcome::Completed(result),
        Ok(Err(error)) => StepOutcome::Failed(error),
        Err(cause) => {
            let message = cause
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "flow logic panicked".to_owned());
            warn!(flow_id = %ctx.flow_id, %message, "flow logic panicked");
            StepOutcome::Failed(FlowException::logic(format!("panic: {message}")))
        }
    }
}
