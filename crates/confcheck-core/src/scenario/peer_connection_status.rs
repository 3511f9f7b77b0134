//! Peer connection status scenario
//!
//! Checks that every participant's connection indicator follows the media
//! path of its peers:
//!
//! 1. two participants join;
//! 2. the second one's media port is blocked, and both the first
//!    participant's view of it and its own view turn disconnected;
//! 3. the block is lifted and both views recover;
//! 4. the port is blocked again and kept blocked until the server expires
//!    the second participant's channels;
//! 5. a third participant joining now must see the second as disconnected
//!    right away, while seeing the first as connected;
//! 6. the second participant rejoins with ICE forced to fail, and everyone
//!    must keep reporting it as disconnected once the grace period is over.
//!
//! Cleanup closes every participant and clears all firewall rules, also
//! when the run is interrupted.

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use super::{interruptible, run_scoped, Interrupt, ScenarioReport, StepLog};
use crate::clock::Clock;
use crate::config::TimingConfig;
use crate::error::{HarnessError, Result};
use crate::fault::{FaultInjector, FaultInjectorExt};
use crate::factory::SessionFactory;
use crate::pool::SessionPool;
use crate::session::{Ordinal, Session, SessionConfig, FAIL_ICE_OVERRIDE};
use crate::verifier::ConnectivityVerifier;

pub const NAME: &str = "peer_connection_status";

pub struct PeerConnectionStatusScenario<F: SessionFactory> {
    fixture: Fixture<F>,
    log: StepLog,
    interrupt: Option<Interrupt>,
}

struct Fixture<F: SessionFactory> {
    pool: SessionPool<F>,
    injector: Option<Arc<dyn FaultInjector>>,
    verifier: ConnectivityVerifier,
    clock: Arc<dyn Clock>,
    timing: TimingConfig,
    /// Media port of the second participant, blocked twice
    second_port: Option<u16>,
}

impl<F: SessionFactory> PeerConnectionStatusScenario<F> {
    pub fn new(
        pool: SessionPool<F>,
        injector: Option<Arc<dyn FaultInjector>>,
        clock: Arc<dyn Clock>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            fixture: Fixture {
                pool,
                injector,
                verifier: ConnectivityVerifier::from_timing(clock.clone(), &timing),
                clock: clock.clone(),
                timing,
                second_port: None,
            },
            log: StepLog::new(clock),
            interrupt: None,
        }
    }

    /// Stop early, still cleaning up, once `interrupt` resolves
    pub fn with_interrupt(mut self, interrupt: impl Future<Output = ()> + Send + 'static) -> Self {
        self.interrupt = Some(Box::pin(interrupt));
        self
    }

    pub fn pool(&self) -> &SessionPool<F> {
        &self.fixture.pool
    }

    /// Run every step, then clean up
    ///
    /// Skipped without touching any participant when no fault injector is
    /// configured.
    pub async fn run(&mut self) -> ScenarioReport {
        if self.fixture.injector.is_none() {
            return ScenarioReport::skipped(NAME, "no fault injection script configured");
        }

        info!("Running {}", NAME);
        let started = self.fixture.clock.now();
        let interrupt = self.interrupt.take();
        let result = run_scoped(
            self,
            move |scenario| Box::pin(interruptible(scenario.run_steps(), interrupt)),
            |scenario| Box::pin(scenario.fixture.cleanup()),
        )
        .await;
        let duration = self.fixture.clock.now().saturating_sub(started);

        ScenarioReport::finish(NAME, result, self.log.take(), duration)
    }

    async fn run_steps(&mut self) -> Result<()> {
        let Self { fixture, log, .. } = self;
        fixture.second_port = None;

        log.step("initialize", fixture.initialize()).await?;
        log.step("second_peer_interrupted", fixture.second_peer_interrupted())
            .await?;
        log.step("second_peer_restored", fixture.second_peer_restored())
            .await?;
        log.step("second_peer_expired", fixture.second_peer_expired())
            .await?;
        log.step(
            "join_third_while_second_expired",
            fixture.join_third_while_second_expired(),
        )
        .await?;
        log.step("second_fails_ice_on_join", fixture.second_fails_ice_on_join())
            .await?;
        Ok(())
    }
}

impl<F: SessionFactory> Fixture<F> {
    fn injector(&self) -> Result<Arc<dyn FaultInjector>> {
        self.injector
            .clone()
            .ok_or_else(|| HarnessError::config("no fault injection script configured"))
    }

    async fn initialize(&mut self) -> Result<()> {
        self.pool.ensure(2).await?;
        Ok(())
    }

    async fn second_peer_interrupted(&mut self) -> Result<()> {
        let injector = self.injector()?;
        let timeout = self.timing.indication_timeout();
        let first = self.pool.require(Ordinal::FIRST)?;
        let second = self.pool.require(Ordinal::SECOND)?;

        let port = second.media_port().await?;
        self.second_port = Some(port);
        injector.block_port_checked(port).await?;

        self.verifier
            .verify_remote_indication(first, second, false, timeout)
            .await?;
        self.verifier
            .verify_local_indication(second, false, timeout)
            .await?;
        Ok(())
    }

    async fn second_peer_restored(&mut self) -> Result<()> {
        let injector = self.injector()?;
        let timeout = self.timing.indication_timeout();
        injector.clear_all_rules().await?;

        let first = self.pool.require(Ordinal::FIRST)?;
        let second = self.pool.require(Ordinal::SECOND)?;
        self.verifier
            .verify_remote_indication(first, second, true, timeout)
            .await?;
        self.verifier
            .verify_local_indication(second, true, timeout)
            .await?;
        Ok(())
    }

    async fn second_peer_expired(&mut self) -> Result<()> {
        let injector = self.injector()?;
        let timeout = self.timing.indication_timeout();
        let port = self
            .second_port
            .ok_or_else(|| HarnessError::config("second participant's media port was never read"))?;
        injector.block_port_checked(port).await?;

        let first = self.pool.require(Ordinal::FIRST)?;
        let second = self.pool.require(Ordinal::SECOND)?;
        self.verifier
            .verify_remote_indication(first, second, false, timeout)
            .await?;
        self.verifier
            .verify_local_indication(second, false, timeout)
            .await?;

        info!(
            "Waiting {:?} for the server to expire the {} participant's channels",
            self.timing.channel_expiry(),
            Ordinal::SECOND
        );
        self.clock.sleep(self.timing.channel_expiry()).await;
        Ok(())
    }

    async fn join_third_while_second_expired(&mut self) -> Result<()> {
        let injector = self.injector()?;
        self.pool.ensure(3).await?;

        let first = self.pool.require(Ordinal::FIRST)?;
        let second = self.pool.require(Ordinal::SECOND)?;
        let third = self.pool.require(Ordinal::THIRD)?;
        // The third participant never saw the second one connected
        self.verifier
            .verify_remote_indication(third, second, false, self.timing.fresh_join_timeout())
            .await?;
        self.verifier
            .verify_remote_indication(third, first, true, self.timing.indication_timeout())
            .await?;

        injector.clear_all_rules().await
    }

    async fn second_fails_ice_on_join(&mut self) -> Result<()> {
        self.pool.close(Ordinal::SECOND).await?;
        self.pool
            .create(
                Ordinal::SECOND,
                SessionConfig::new().with_override(FAIL_ICE_OVERRIDE, "true"),
            )
            .await?;

        let timeout = self.timing.indication_timeout();
        let first = self.pool.require(Ordinal::FIRST)?;
        let second = self.pool.require(Ordinal::SECOND)?;
        let third = self.pool.require(Ordinal::THIRD)?;
        self.verifier
            .verify_joined(second, self.timing.join_timeout())
            .await?;

        info!(
            "Waiting {:?} for the failed connection to be reported",
            self.timing.failed_connection_grace()
        );
        self.clock.sleep(self.timing.failed_connection_grace()).await;

        self.verifier
            .verify_remote_indication(first, second, false, timeout)
            .await?;
        self.verifier
            .verify_remote_indication(third, second, false, timeout)
            .await?;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        info!("Cleaning up {}", NAME);
        let closed = self.pool.close_all().await;
        let cleared = match &self.injector {
            Some(injector) => injector.clear_all_rules().await,
            None => Ok(()),
        };
        if let Err(e) = &cleared {
            warn!("Failed to clear firewall rules: {}", e);
        }
        closed.and(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::scenario::ScenarioOutcome;
    use crate::session::SessionKind;
    use crate::testing::{FirewallCall, MockConference, MockFirewall, MockSessionFactory};

    fn scenario(
        conference: &MockConference,
        injector: Option<Arc<dyn FaultInjector>>,
        clock: &VirtualClock,
    ) -> PeerConnectionStatusScenario<MockSessionFactory> {
        let pool = SessionPool::new(MockSessionFactory::new(conference.clone(), SessionKind::Web));
        PeerConnectionStatusScenario::new(pool, injector, Arc::new(clock.clone()), TimingConfig::default())
    }

    #[tokio::test]
    async fn test_skipped_without_injector() {
        let conference = MockConference::new();
        let clock = VirtualClock::new();
        let mut scenario = scenario(&conference, None, &clock);

        let report = scenario.run().await;

        assert!(report.skipped_run());
        assert!(report.steps.is_empty());
        assert!(scenario.pool().factory().created().is_empty());
    }

    #[tokio::test]
    async fn test_failed_block_still_cleans_up() {
        let conference = MockConference::new();
        let clock = VirtualClock::new();
        let firewall = MockFirewall::new(conference.clone());
        firewall.fail_blocks();
        let mut scenario = scenario(&conference, Some(Arc::new(firewall.clone())), &clock);

        let report = scenario.run().await;

        assert!(matches!(report.outcome, ScenarioOutcome::Failed(_)));
        assert_eq!(report.failed_step().unwrap().name, "second_peer_interrupted");
        assert_eq!(report.steps.len(), 2);
        assert!(scenario.pool().is_empty());
        assert_eq!(conference.present(), 0);
        assert_eq!(firewall.calls().last(), Some(&FirewallCall::Clear));
    }

    #[tokio::test]
    async fn test_interrupt_during_expiry_wait_still_cleans_up() {
        let conference = MockConference::new();
        let clock = VirtualClock::new();
        let firewall = MockFirewall::new(conference.clone());
        let expiry = TimingConfig::default().channel_expiry();
        let watch = clock.clone();
        let mut scenario = scenario(&conference, Some(Arc::new(firewall.clone())), &clock)
            .with_interrupt(async move {
                while watch.elapsed() < expiry {
                    tokio::task::yield_now().await;
                }
            });

        let report = scenario.run().await;

        assert_eq!(
            report.outcome,
            ScenarioOutcome::Failed(HarnessError::Interrupted.to_string())
        );
        let names: Vec<&str> = report.steps.iter().map(|step| step.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["initialize", "second_peer_interrupted", "second_peer_restored"]
        );
        assert_eq!(clock.elapsed(), expiry);
        assert!(scenario.pool().is_empty());
        assert_eq!(conference.present(), 0);
        assert!(conference.blocked_ports().is_empty());
        assert_eq!(firewall.calls().last(), Some(&FirewallCall::Clear));
    }
}
