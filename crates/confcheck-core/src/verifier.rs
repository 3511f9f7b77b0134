//! Timeout-bounded connectivity assertions
//!
//! Every assertion samples a session until the sample matches the expected
//! state or the deadline passes. The first sample is taken immediately,
//! later ones every `poll_interval`, with the last sleep clipped to the
//! deadline. Reads that fail with [`HarnessError::Observation`] are counted
//! rather than fatal; any successful read resets the count, and hitting
//! `max_transient_failures` in a row ends the assertion as a timeout. Other
//! errors end it immediately.
//!
//! The verifier only reads. It never starts, stops or reconfigures sessions.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::TimingConfig;
use crate::error::{HarnessError, Result, TimeoutCause};
use crate::session::Session;

/// Result of a successful assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    /// Samples taken, including the matching one
    pub polls: u32,
    pub elapsed: Duration,
}

/// One connectivity expectation, used for logs and failure messages
#[derive(Debug, Clone)]
pub struct ConnectivityAssertion {
    pub observer: String,
    /// `None` for a session's view of its own connection
    pub observed: Option<String>,
    pub expected_connected: bool,
    pub timeout: Duration,
}

impl fmt::Display for ConnectivityAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.expected_connected {
            "connected"
        } else {
            "disconnected"
        };
        match &self.observed {
            Some(observed) => write!(f, "{} to see the {} as {}", self.observer, observed, state),
            None => write!(f, "{} to see itself as {}", self.observer, state),
        }
    }
}

#[derive(Clone)]
pub struct ConnectivityVerifier {
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    max_transient_failures: u32,
}

impl ConnectivityVerifier {
    pub fn new(clock: Arc<dyn Clock>, poll_interval: Duration, max_transient_failures: u32) -> Self {
        Self {
            clock,
            poll_interval,
            max_transient_failures: max_transient_failures.max(1),
        }
    }

    pub fn from_timing(clock: Arc<dyn Clock>, timing: &TimingConfig) -> Self {
        Self::new(clock, timing.poll_interval(), timing.max_transient_failures)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until `observer` renders `observed` in the expected state
    pub async fn verify_remote_indication<O, P>(
        &self,
        observer: &O,
        observed: &P,
        expected_connected: bool,
        timeout: Duration,
    ) -> Result<Verification>
    where
        O: Session + ?Sized,
        P: Session + ?Sized,
    {
        let assertion = ConnectivityAssertion {
            observer: observer.label(),
            observed: Some(observed.label()),
            expected_connected,
            timeout,
        };
        let started = self.clock.now();
        let endpoint = self.endpoint_of(observed, &assertion).await?;
        let remaining = timeout.saturating_sub(self.clock.now().saturating_sub(started));
        let endpoint = endpoint.as_str();

        self.check(&assertion, remaining, move || observer.remote_indicator(endpoint))
            .await
    }

    /// Wait until `session`'s own connection indicator shows the expected state
    pub async fn verify_local_indication<S>(
        &self,
        session: &S,
        expected_connected: bool,
        timeout: Duration,
    ) -> Result<Verification>
    where
        S: Session + ?Sized,
    {
        let assertion = ConnectivityAssertion {
            observer: session.label(),
            observed: None,
            expected_connected,
            timeout,
        };
        self.check(&assertion, timeout, move || session.local_indicator())
            .await
    }

    /// Wait until `session` reports being inside the conference room
    pub async fn verify_joined<S>(&self, session: &S, timeout: Duration) -> Result<Verification>
    where
        S: Session + ?Sized,
    {
        let description = format!("{} to join the conference", session.label());
        self.poll(&description, true, timeout, move || session.is_joined())
            .await
    }

    async fn check<F, Fut>(
        &self,
        assertion: &ConnectivityAssertion,
        timeout: Duration,
        sample: F,
    ) -> Result<Verification>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        info!("Expecting {} within {:?}", assertion, assertion.timeout);
        let verification = self
            .poll(&assertion.to_string(), assertion.expected_connected, timeout, sample)
            .await?;
        info!(
            "Observed {} after {:?} ({} polls)",
            assertion, verification.elapsed, verification.polls
        );
        Ok(verification)
    }

    /// Peer endpoint ids are read under the same transient-failure budget
    async fn endpoint_of<P>(&self, observed: &P, assertion: &ConnectivityAssertion) -> Result<String>
    where
        P: Session + ?Sized,
    {
        let started = self.clock.now();
        let mut failures = 0;
        loop {
            match observed.endpoint_id().await {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    warn!("Reading endpoint of {} failed ({}): {}", observed.label(), failures, e);
                    let elapsed = self.clock.now().saturating_sub(started);
                    if failures >= self.max_transient_failures || elapsed >= assertion.timeout {
                        return Err(HarnessError::VerificationTimeout {
                            assertion: assertion.to_string(),
                            expected: assertion.expected_connected,
                            last_observed: None,
                            elapsed,
                            cause: TimeoutCause::TransientReadsExhausted {
                                failures,
                                last_error: e.to_string(),
                            },
                        });
                    }
                    let remaining = assertion.timeout.saturating_sub(elapsed);
                    self.clock.sleep(self.poll_interval.min(remaining)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sample until a value equals `expected` or `timeout` passes
    pub async fn poll<F, Fut>(
        &self,
        description: &str,
        expected: bool,
        timeout: Duration,
        mut sample: F,
    ) -> Result<Verification>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let started = self.clock.now();
        let mut polls = 0;
        let mut failures = 0;
        let mut last_observed = None;

        loop {
            polls += 1;
            match sample().await {
                Ok(value) => {
                    failures = 0;
                    last_observed = Some(value);
                    debug!("Poll {} for {}: {}", polls, description, value);
                    if value == expected {
                        return Ok(Verification {
                            polls,
                            elapsed: self.clock.now().saturating_sub(started),
                        });
                    }
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    warn!(
                        "Poll {} for {} failed ({}/{}): {}",
                        polls, description, failures, self.max_transient_failures, e
                    );
                    if failures >= self.max_transient_failures {
                        return Err(HarnessError::VerificationTimeout {
                            assertion: description.to_string(),
                            expected,
                            last_observed,
                            elapsed: self.clock.now().saturating_sub(started),
                            cause: TimeoutCause::TransientReadsExhausted {
                                failures,
                                last_error: e.to_string(),
                            },
                        });
                    }
                }
                Err(e) => return Err(e),
            }

            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed >= timeout {
                return Err(HarnessError::VerificationTimeout {
                    assertion: description.to_string(),
                    expected,
                    last_observed,
                    elapsed,
                    cause: TimeoutCause::DeadlineElapsed,
                });
            }
            self.clock.sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::session::Ordinal;
    use crate::testing::{MockConference, MockSession, ScriptedRead};

    fn verifier(clock: &VirtualClock) -> ConnectivityVerifier {
        ConnectivityVerifier::new(Arc::new(clock.clone()), Duration::from_millis(500), 3)
    }

    async fn pair(conference: &MockConference) -> (MockSession, MockSession) {
        let first = conference.join(Ordinal::FIRST).await.unwrap();
        let second = conference.join(Ordinal::SECOND).await.unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_immediate_match_returns_without_waiting() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, second) = pair(&conference).await;
        first.script_reads([ScriptedRead::Disconnected]);

        let verification = verifier(&clock)
            .verify_remote_indication(&first, &second, false, Duration::from_secs(15))
            .await
            .unwrap();

        assert_eq!(verification.polls, 1);
        assert_eq!(verification.elapsed, Duration::ZERO);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_never_matching_times_out_at_deadline() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, second) = pair(&conference).await;

        let err = verifier(&clock)
            .verify_remote_indication(&first, &second, false, Duration::from_secs(15))
            .await
            .unwrap_err();

        match err {
            HarnessError::VerificationTimeout {
                expected,
                last_observed,
                elapsed,
                cause,
                ..
            } => {
                assert!(!expected);
                assert_eq!(last_observed, Some(true));
                assert_eq!(elapsed, Duration::from_secs(15));
                assert_eq!(cause, TimeoutCause::DeadlineElapsed);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(first.reads(), 31);
    }

    #[tokio::test]
    async fn test_last_sleep_is_clipped_to_deadline() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, _) = pair(&conference).await;

        let err = verifier(&clock)
            .verify_local_indication(&first, false, Duration::from_millis(1200))
            .await
            .unwrap_err();

        assert!(err.is_verification_timeout());
        assert_eq!(clock.elapsed(), Duration::from_millis(1200));
        assert_eq!(first.reads(), 4);
    }

    #[tokio::test]
    async fn test_transient_failures_are_tolerated() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, second) = pair(&conference).await;
        first.script_reads([
            ScriptedRead::Transient("stale element"),
            ScriptedRead::Transient("stale element"),
            ScriptedRead::Connected,
            ScriptedRead::Transient("stale element"),
            ScriptedRead::Transient("stale element"),
            ScriptedRead::Disconnected,
        ]);

        let verification = verifier(&clock)
            .verify_remote_indication(&first, &second, false, Duration::from_secs(15))
            .await
            .unwrap();

        assert_eq!(verification.polls, 6);
        assert_eq!(verification.elapsed, Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_exhausted_transient_budget_escalates() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, _) = pair(&conference).await;
        first.script_reads([
            ScriptedRead::Connected,
            ScriptedRead::Transient("no such element"),
            ScriptedRead::Transient("no such element"),
            ScriptedRead::Transient("no such element"),
        ]);

        let err = verifier(&clock)
            .verify_local_indication(&first, false, Duration::from_secs(15))
            .await
            .unwrap_err();

        match err {
            HarnessError::VerificationTimeout {
                last_observed,
                cause: TimeoutCause::TransientReadsExhausted { failures, last_error },
                ..
            } => {
                assert_eq!(failures, 3);
                assert_eq!(last_observed, Some(true));
                assert!(last_error.contains("no such element"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_non_transient_error_aborts_immediately() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, _) = pair(&conference).await;
        first.script_reads([ScriptedRead::Fatal("driver session deleted")]);

        let err = verifier(&clock)
            .verify_local_indication(&first, true, Duration::from_secs(15))
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::SessionLifecycle { .. }));
        assert_eq!(first.reads(), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_unreadable_endpoint_exhausts_the_budget() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, second) = pair(&conference).await;
        second.fail_endpoint_reads(["thumbnail not rendered"; 3]);

        let err = verifier(&clock)
            .verify_remote_indication(&first, &second, false, Duration::from_secs(15))
            .await
            .unwrap_err();

        match err {
            HarnessError::VerificationTimeout {
                last_observed,
                elapsed,
                cause: TimeoutCause::TransientReadsExhausted { failures, last_error },
                ..
            } => {
                assert_eq!(failures, 3);
                assert_eq!(last_observed, None);
                assert_eq!(elapsed, Duration::from_millis(1000));
                assert!(last_error.contains("thumbnail not rendered"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(first.reads(), 0);
    }

    #[tokio::test]
    async fn test_endpoint_recovers_within_budget() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, second) = pair(&conference).await;
        second.fail_endpoint_reads(["thumbnail not rendered"; 2]);
        first.script_reads([ScriptedRead::Disconnected]);

        let verification = verifier(&clock)
            .verify_remote_indication(&first, &second, false, Duration::from_secs(15))
            .await
            .unwrap();

        assert_eq!(verification.polls, 1);
        assert_eq!(clock.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_verify_joined() {
        let clock = VirtualClock::new();
        let conference = MockConference::new();
        let (first, _) = pair(&conference).await;

        let verification = verifier(&clock)
            .verify_joined(&first, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(verification.polls, 1);
    }

    #[test]
    fn test_assertion_display() {
        let assertion = ConnectivityAssertion {
            observer: "first web participant".to_string(),
            observed: Some("second web participant".to_string()),
            expected_connected: false,
            timeout: Duration::from_secs(15),
        };
        assert_eq!(
            assertion.to_string(),
            "first web participant to see the second web participant as disconnected"
        );
    }
}
