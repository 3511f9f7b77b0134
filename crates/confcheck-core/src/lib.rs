//! confcheck core
//!
//! Orchestrates automated conference participants (browsers over WebDriver,
//! mobile apps over Appium), injects port-level network faults against them
//! through an external firewall script, and verifies by bounded polling that
//! every participant's connection indicator ends up showing the expected
//! state of its peers.
//!
//! - [`pool::SessionPool`]: ordinal-keyed participants created by a
//!   [`factory::SessionFactory`]
//! - [`fault::FaultInjector`]: blocks a port or clears every block
//! - [`verifier::ConnectivityVerifier`]: timeout-bounded indicator checks
//! - [`scenario`]: the step sequences composed from the above

pub mod clock;
pub mod config;
pub mod error;
pub mod factory;
pub mod fault;
pub mod pool;
pub mod scenario;
pub mod session;
pub mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::HarnessConfig;
pub use error::{HarnessError, Result, TimeoutCause};
pub use factory::{HybridSessionFactory, MobileSessionFactory, SessionFactory, WebSessionFactory};
pub use fault::{FaultInjector, FaultInjectorExt, IntoPort, ScriptFaultInjector};
pub use pool::SessionPool;
pub use scenario::{
    ClientPerformanceScenario, PeerConnectionStatusScenario, ScenarioOutcome, ScenarioReport,
};
pub use session::{Ordinal, PoolKind, Session, SessionConfig, SessionId, SessionKind};
pub use verifier::{ConnectivityVerifier, Verification};
