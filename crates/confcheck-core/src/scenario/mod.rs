//! Scenario driver
//!
//! A scenario is an ordered list of steps run on one task. Every step is
//! fatal: the first failing step ends the run. Cleanup (closing sessions,
//! lifting firewall blocks) is attached through [`run_scoped`] and runs on
//! every exit path, so a failed scenario cannot leak blocked ports or live
//! driver sessions into the next one. An [`Interrupt`] (Ctrl-C in the CLI)
//! ends the body early and still goes through cleanup.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{HarnessError, Result};

pub mod client_performance;
pub mod peer_connection_status;

pub use client_performance::ClientPerformanceScenario;
pub use peer_connection_status::PeerConnectionStatusScenario;

/// Boxed future borrowing the scenario state for `'a`
pub type ScopedFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + 'a>>;

/// Resolves when the run should stop early
pub type Interrupt = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Race `body` against `interrupt`, which wins when both are ready
pub async fn interruptible<T, B>(body: B, interrupt: Option<Interrupt>) -> Result<T>
where
    B: Future<Output = Result<T>>,
{
    let Some(interrupt) = interrupt else {
        return body.await;
    };
    tokio::select! {
        biased;
        _ = interrupt => {
            warn!("Interrupted, abandoning the current step");
            Err(HarnessError::Interrupted)
        }
        result = body => result,
    }
}

/// Run `body` on `state`, then `cleanup`, whatever the body returned
///
/// The body's error wins; a cleanup error is returned only when the body
/// succeeded and is otherwise logged.
pub async fn run_scoped<S, T, B, C>(state: &mut S, body: B, cleanup: C) -> Result<T>
where
    S: ?Sized,
    B: for<'a> FnOnce(&'a mut S) -> ScopedFuture<'a, T>,
    C: for<'a> FnOnce(&'a mut S) -> ScopedFuture<'a, ()>,
{
    let outcome = body(&mut *state).await;
    let cleaned = cleanup(&mut *state).await;

    match (outcome, cleaned) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => {
            error!("Cleanup failed: {}", e);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_error)) => {
            warn!("Cleanup after failure also failed: {}", cleanup_error);
            Err(e)
        }
    }
}

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ScenarioOutcome {
    Passed,
    Failed(String),
    /// Preconditions missing, nothing was run
    Skipped(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub duration: Duration,
    pub passed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub outcome: ScenarioOutcome,
    pub steps: Vec<StepReport>,
    pub duration: Duration,
}

impl ScenarioReport {
    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("Skipping {}: {}", name, reason);
        Self {
            name: name.to_string(),
            outcome: ScenarioOutcome::Skipped(reason),
            steps: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Build the report from a finished run
    pub fn finish(name: &str, result: Result<()>, steps: Vec<StepReport>, duration: Duration) -> Self {
        let outcome = match result {
            Ok(()) => {
                info!("{} passed in {:?}", name, duration);
                ScenarioOutcome::Passed
            }
            Err(e) => {
                error!("{} failed after {:?}: {}", name, duration, e);
                ScenarioOutcome::Failed(e.to_string())
            }
        };
        Self {
            name: name.to_string(),
            outcome,
            steps,
            duration,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }

    pub fn skipped_run(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Skipped(_))
    }

    /// The step that ended the run, if any
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps.iter().find(|step| !step.passed)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            ScenarioOutcome::Passed => writeln!(f, "{}: PASSED ({:?})", self.name, self.duration)?,
            ScenarioOutcome::Failed(reason) => {
                writeln!(f, "{}: FAILED ({:?}): {}", self.name, self.duration, reason)?
            }
            ScenarioOutcome::Skipped(reason) => writeln!(f, "{}: SKIPPED: {}", self.name, reason)?,
        }
        for step in &self.steps {
            let status = if step.passed { "ok" } else { "FAILED" };
            writeln!(f, "  {:<36} {:>6} {:?}", step.name, status, step.duration)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Step log
// ----------------------------------------------------------------------------

/// Times and records the steps of one run
pub struct StepLog {
    clock: Arc<dyn Clock>,
    steps: Vec<StepReport>,
}

impl StepLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            steps: Vec::new(),
        }
    }

    /// Run one step, recording its outcome
    pub async fn step<T, Fut>(&mut self, name: &str, step: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        info!("Step {}: {}", self.steps.len() + 1, name);
        let started = self.clock.now();
        let result = step.await;
        let duration = self.clock.now().saturating_sub(started);

        if let Err(e) = &result {
            error!("Step {} failed: {}", name, e);
        }
        self.steps.push(StepReport {
            name: name.to_string(),
            duration,
            passed: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Hand the recorded steps over, leaving the log empty
    pub fn take(&mut self) -> Vec<StepReport> {
        std::mem::take(&mut self.steps)
    }
}
