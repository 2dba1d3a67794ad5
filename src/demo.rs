//! Echo protocol used by the `demo` subcommand and as a reference flow
//! pair.
//!
//! The initiator sends a text payload and waits for the reply; the
//! responder answers with the text repeated twice.

use serde::{Deserialize, Serialize};

use crate::errors::FlowException;
use crate::flow::{Flow, FlowContext, FlowRegistry, InitiatedFlow, Step};
use crate::models::io_request::Resume;
use crate::models::message::{Payload, TEXT_TYPE};
use crate::models::session::{Party, SessionId};

/// Sends `message` to `counterparty` and completes with the echoed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoInitiator {
    counterparty: Party,
    message: String,
    session: Option<SessionId>,
}

impl EchoInitiator {
    /// Echo `message` via `counterparty`.
    pub fn new(counterparty: Party, message: impl Into<String>) -> Self {
        Self {
            counterparty,
            message: message.into(),
            session: None,
        }
    }
}

impl Flow for EchoInitiator {
    const NAME: &'static str = "demo.echo";

    fn resume(&mut self, ctx: &mut FlowContext<'_>, input: Resume) -> Result<Step, FlowException> {
        match input {
            Resume::Start => {
                let session = ctx.initiate_flow(self.counterparty.clone());
                self.session = Some(session);
                Ok(Step::send_and_receive(
                    session,
                    Payload::text(self.message.clone()),
                    TEXT_TYPE,
                ))
            }
            Resume::Received(reply) => Ok(Step::Complete(reply)),
            Resume::Failed(err) => Err(err),
            other => Err(FlowException::logic(format!("echo initiator resumed with {other:?}"))),
        }
    }
}

/// Answers one echo request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponder {
    session: SessionId,
    counterparty: Party,
}

impl Flow for EchoResponder {
    const NAME: &'static str = "demo.echo-responder";

    fn resume(&mut self, _ctx: &mut FlowContext<'_>, input: Resume) -> Result<Step, FlowException> {
        match input {
            Resume::Start => Ok(Step::receive(self.session, TEXT_TYPE)),
            Resume::Received(payload) => {
                let text = payload
                    .as_text()
                    .ok_or_else(|| FlowException::logic("echo payload is not text"))?;
                Ok(Step::send(self.session, Payload::text(format!("{text}{text}"))))
            }
            Resume::Sent => Ok(Step::Complete(Payload::text(self.counterparty.name()))),
            Resume::Failed(err) => Err(err),
            other => Err(FlowException::logic(format!("echo responder resumed with {other:?}"))),
        }
    }
}

impl InitiatedFlow for EchoResponder {
    fn initiated(session: SessionId, counterparty: Party) -> Self {
        Self {
            session,
            counterparty,
        }
    }
}

/// Install both halves of the echo protocol.
pub async fn register(registry: &FlowRegistry) {
    registry.register::<EchoInitiator>().await;
    registry
        .register_initiated_flow_handler::<EchoResponder>(EchoInitiator::descriptor())
        .await;
}
