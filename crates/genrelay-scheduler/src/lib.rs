//! Job lifecycle: generate dispatch and the poll state machine.

pub mod dispatcher;
pub mod messages;
pub mod poll;

pub use dispatcher::{DispatchOutcome, JobDispatcher};
pub use poll::{PollScheduler, PollStep};

use anyhow::Result;
use genrelay_queue::{Activation, ActivationKind};

/// Routes queued activations to the dispatcher or the poll scheduler.
#[derive(Debug)]
pub struct Scheduler {
    pub dispatcher: JobDispatcher,
    pub poller: PollScheduler,
}

impl Scheduler {
    pub fn new(dispatcher: JobDispatcher, poller: PollScheduler) -> Self {
        Self { dispatcher, poller }
    }

    pub async fn run(&self, activation: &Activation) -> Result<()> {
        let job = activation.descriptor.clone();
        match activation.kind {
            ActivationKind::Generate => {
                let outcome = self.dispatcher.dispatch(job).await?;
                tracing::debug!(id = %activation.id, ?outcome, "generate activation done");
            }
            ActivationKind::Poll => {
                let step = self.poller.activate(job).await?;
                tracing::debug!(id = %activation.id, ?step, "poll activation done");
            }
        }
        Ok(())
    }
}
