//! Client performance scenario
//!
//! Three participants sit in the call for a while, then hang up. Nothing is
//! asserted about connectivity; the run exists so client-side resource usage
//! can be measured over a call of known length.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{interruptible, run_scoped, Interrupt, ScenarioReport, StepLog};
use crate::clock::Clock;
use crate::error::Result;
use crate::factory::SessionFactory;
use crate::pool::SessionPool;

pub const NAME: &str = "client_performance";

pub struct ClientPerformanceScenario<F: SessionFactory> {
    pool: SessionPool<F>,
    clock: Arc<dyn Clock>,
    participants: u32,
    hold: Duration,
    log: StepLog,
    interrupt: Option<Interrupt>,
}

impl<F: SessionFactory> ClientPerformanceScenario<F> {
    pub fn new(pool: SessionPool<F>, clock: Arc<dyn Clock>, hold: Duration) -> Self {
        Self {
            pool,
            log: StepLog::new(clock.clone()),
            clock,
            participants: 3,
            hold,
            interrupt: None,
        }
    }

    /// Stop early, still closing every participant, once `interrupt` resolves
    pub fn with_interrupt(mut self, interrupt: impl Future<Output = ()> + Send + 'static) -> Self {
        self.interrupt = Some(Box::pin(interrupt));
        self
    }

    pub fn with_participants(mut self, participants: u32) -> Self {
        self.participants = participants;
        self
    }

    pub fn pool(&self) -> &SessionPool<F> {
        &self.pool
    }

    pub async fn run(&mut self) -> ScenarioReport {
        info!("Running {} with {} participants", NAME, self.participants);
        let started = self.clock.now();
        let interrupt = self.interrupt.take();
        let result = run_scoped(
            self,
            move |scenario| Box::pin(interruptible(scenario.run_steps(), interrupt)),
            |scenario| Box::pin(scenario.pool.close_all()),
        )
        .await;
        let duration = self.clock.now().saturating_sub(started);

        ScenarioReport::finish(NAME, result, self.log.take(), duration)
    }

    async fn run_steps(&mut self) -> Result<()> {
        let Self {
            pool,
            clock,
            participants,
            hold,
            log,
            ..
        } = self;

        log.step("join_participants", async {
            pool.ensure(*participants).await.map(|_| ())
        })
        .await?;
        log.step("hold_call", async {
            info!("Keeping {} participants in the call for {:?}", pool.len(), hold);
            clock.sleep(*hold).await;
            Ok(())
        })
        .await?;
        log.step("hang_up", pool.hang_up_all()).await?;
        Ok(())
    }
}
