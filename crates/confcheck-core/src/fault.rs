//! Port-level fault injection
//!
//! The harness never edits firewall rules itself. It shells out to an
//! operator-provided script that owns the blocked-port bookkeeping and
//! implements this contract:
//!
//! - `--block-port <port>` drops inbound and outbound TCP and UDP traffic on
//!   `<port>`. Whether a previously blocked port stays blocked is up to the
//!   script. It must also drop this host's traffic to the media server's TCP
//!   port (4443 by default) so media cannot fall back to TCP, and must leave
//!   the signalling connection alone.
//! - `--clear-rules` removes every block applied earlier.
//!
//! Both commands are idempotent and report success only through the exit
//! status.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::{HarnessError, Result};

/// Anything that can block a port and later lift every block
#[async_trait]
pub trait FaultInjector: Send + Sync {
    async fn block_port(&self, port: u16) -> Result<()>;

    async fn clear_all_rules(&self) -> Result<()>;
}

/// Values accepted as a port number before validation
pub trait IntoPort {
    fn into_port(self) -> Result<u16>;
}

fn port_from_i64(value: i64) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| HarnessError::config(format!("Invalid port number: {}", value)))
}

impl IntoPort for u16 {
    fn into_port(self) -> Result<u16> {
        Ok(self)
    }
}

impl IntoPort for i64 {
    fn into_port(self) -> Result<u16> {
        port_from_i64(self)
    }
}

impl IntoPort for i32 {
    fn into_port(self) -> Result<u16> {
        port_from_i64(i64::from(self))
    }
}

impl IntoPort for &str {
    fn into_port(self) -> Result<u16> {
        let value = self
            .trim()
            .parse::<i64>()
            .map_err(|_| HarnessError::config(format!("Invalid port number: {}", self)))?;
        port_from_i64(value)
    }
}

impl IntoPort for String {
    fn into_port(self) -> Result<u16> {
        self.as_str().into_port()
    }
}

/// Validation in front of [`FaultInjector::block_port`]
#[async_trait]
pub trait FaultInjectorExt: FaultInjector {
    /// Validate `port` and block it; invalid input never reaches the injector
    async fn block_port_checked<P>(&self, port: P) -> Result<u16>
    where
        P: IntoPort + Send,
    {
        let port = port.into_port()?;
        self.block_port(port).await?;
        Ok(port)
    }
}

impl<T: FaultInjector + ?Sized> FaultInjectorExt for T {}

// ----------------------------------------------------------------------------
// Script-backed injector
// ----------------------------------------------------------------------------

/// Runs the external firewall script
///
/// Holds nothing but the script path, so one instance can serve a whole run.
#[derive(Debug, Clone)]
pub struct ScriptFaultInjector {
    script: PathBuf,
}

impl ScriptFaultInjector {
    pub fn new(script: impl AsRef<Path>) -> Result<Self> {
        let script = script.as_ref();
        if script.as_os_str().is_empty() {
            return Err(HarnessError::config("fault injection script path is empty"));
        }
        if !script.is_file() {
            return Err(HarnessError::config(format!(
                "fault injection script {} does not exist",
                script.display()
            )));
        }
        Ok(Self {
            script: script.to_path_buf(),
        })
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let command = format!("{} {}", self.script.display(), args.join(" "));

        let output = Command::new(&self.script)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to launch `{}`: {}", command, e);
                HarnessError::ExternalProcess {
                    command: command.clone(),
                    status: "not started".to_string(),
                    stderr: e.to_string(),
                }
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            debug!("`{}` stderr: {}", command, stderr);
        }

        if !output.status.success() {
            error!("`{}` failed with {}", command, output.status);
            return Err(HarnessError::ExternalProcess {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl FaultInjector for ScriptFaultInjector {
    async fn block_port(&self, port: u16) -> Result<()> {
        info!("Will block port: {}", port);
        self.run(&["--block-port".to_string(), port.to_string()]).await
    }

    async fn clear_all_rules(&self) -> Result<()> {
        info!("Will unblock all previously blocked ports");
        self.run(&["--clear-rules".to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_validation() {
        assert_eq!("5000".into_port().unwrap(), 5000);
        assert_eq!(" 0 ".into_port().unwrap(), 0);
        assert_eq!(65535i64.into_port().unwrap(), 65535);

        assert!(matches!("-1".into_port(), Err(HarnessError::Configuration(_))));
        assert!(matches!("65536".into_port(), Err(HarnessError::Configuration(_))));
        assert!(matches!("rtp".into_port(), Err(HarnessError::Configuration(_))));
        assert!(matches!((-1i32).into_port(), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn test_script_must_exist() {
        assert!(matches!(
            ScriptFaultInjector::new(""),
            Err(HarnessError::Configuration(_))
        ));
        assert!(matches!(
            ScriptFaultInjector::new("/nonexistent/firewall.sh"),
            Err(HarnessError::Configuration(_))
        ));
    }
}
