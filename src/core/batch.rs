/// Sequential batch start/stop/restart with precondition gating
use crate::core::InstanceControl;
use crate::error::{FleetError, FleetResult};
use crate::health::{State, StateSource};
use std::fmt;
use std::sync::Arc;

/// Lifecycle action applied to every instance of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAction {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for BatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchAction::Start => write!(f, "start"),
            BatchAction::Stop => write!(f, "stop"),
            BatchAction::Restart => write!(f, "restart"),
        }
    }
}

/// Per-instance outcome of a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: Vec<u32>,
    /// Instances already in the requested state
    pub skipped: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a report with failures into `FleetError::Batch`
    pub fn into_result(self) -> FleetResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FleetError::Batch {
                failed: self.failed.len(),
                total: self.total(),
            })
        }
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok, {} skipped, {} failed",
            self.succeeded.len(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

/// Runs one lifecycle action over a list of instances, one at a time
pub struct BatchRunner {
    control: Arc<dyn InstanceControl>,
    states: Arc<dyn StateSource>,
    await_ready: bool,
}

impl BatchRunner {
    pub fn new(control: Arc<dyn InstanceControl>, states: Arc<dyn StateSource>) -> Self {
        Self {
            control,
            states,
            await_ready: true,
        }
    }

    pub fn with_await_ready(mut self, await_ready: bool) -> Self {
        self.await_ready = await_ready;
        self
    }

    /// Classify every target, refusing the batch when any of them is dead or
    /// hung and `force` is not set
    pub async fn check(&self, ids: &[u32], force: bool) -> FleetResult<Vec<(u32, State)>> {
        let mut observed = Vec::with_capacity(ids.len());
        for &id in ids {
            observed.push((id, self.states.state(id).await));
        }

        let blocked: Vec<String> = observed
            .iter()
            .filter(|(_, state)| state.blocks_batch())
            .map(|(id, state)| format!("{} ({})", id, state))
            .collect();

        if !blocked.is_empty() && !force {
            return Err(FleetError::precondition(format!(
                "instances block the batch: {}",
                blocked.join(", ")
            )));
        }

        Ok(observed)
    }

    /// Apply `action` to every instance, continuing past failures
    pub async fn run(&self, action: BatchAction, ids: &[u32], force: bool) -> FleetResult<BatchReport> {
        let observed = self.check(ids, force).await?;
        let mut report = BatchReport::default();

        for (id, state) in observed {
            let result = match action {
                BatchAction::Start if state.is_works() => {
                    report.skipped.push(id);
                    continue;
                }
                BatchAction::Stop if state.is_stopped() => {
                    report.skipped.push(id);
                    continue;
                }
                BatchAction::Start => self.start(id, &state).await,
                BatchAction::Stop => self.control.stop(id, force).await,
                BatchAction::Restart => self.restart(id, &state, force).await,
            };

            match result {
                Ok(()) => report.succeeded.push(id),
                Err(e) => {
                    tracing::warn!(id, %action, error = %e, "Batch item failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        tracing::info!(%action, %report, "Batch finished");
        Ok(report)
    }

    async fn start(&self, id: u32, state: &State) -> Result<(), crate::error::ControlError> {
        // Leftovers of a dead or hung process must go before a fresh start
        if state.blocks_batch() {
            self.control.kill(id).await?;
        }
        self.control.start(id, self.await_ready).await
    }

    async fn restart(
        &self,
        id: u32,
        state: &State,
        force: bool,
    ) -> Result<(), crate::error::ControlError> {
        if state.blocks_batch() {
            self.control.kill(id).await?;
        } else if !state.is_stopped() {
            self.control.stop(id, force).await?;
        }
        self.control.start(id, self.await_ready).await
    }
}
