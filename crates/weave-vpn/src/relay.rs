//! Circumvention Relay Exit
//!
//! Runs the relay client as a child process. The client listens on the
//! public bind address and sends its upstream traffic through the local
//! proxy of the tunnel hop.

use crate::config::RelayOptions;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// How long the child must stay up to count as started
pub const STARTUP_GRACE: Duration = Duration::from_secs(2);

/// Relay client launched as an external command
#[derive(Debug, Clone)]
pub struct CommandRelay {
    command: String,
    args: Vec<String>,
    grace: Duration,
}

impl CommandRelay {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            grace: STARTUP_GRACE,
        }
    }

    pub fn from_options(opts: &RelayOptions) -> Self {
        Self::new(opts.command.clone(), opts.args.clone())
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Substitute `{upstream}`, `{listen}` and `{country}` in the arguments
    fn render_args(&self, upstream: SocketAddr, listen: SocketAddr, country: &str) -> Vec<String> {
        let upstream = upstream.to_string();
        let listen = listen.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{upstream}", &upstream)
                    .replace("{listen}", &listen)
                    .replace("{country}", country)
            })
            .collect()
    }

    /// Start the relay client
    ///
    /// Fails if the command cannot be spawned or exits within the grace
    /// period. Afterwards a task on `tracker` kills the child when `ctx` is
    /// cancelled.
    pub async fn start(
        &self,
        ctx: CancellationToken,
        tracker: &TaskTracker,
        upstream: SocketAddr,
        listen: SocketAddr,
        country: &str,
    ) -> Result<(), RelayError> {
        let args = self.render_args(upstream, listen, country);
        info!(command = %self.command, ?args, "starting relay client");

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Spawn(self.command.clone(), e.to_string()))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| RelayError::Spawn(self.command.clone(), e.to_string()))?;
                return Err(RelayError::Exited(status.to_string()));
            }
            _ = tokio::time::sleep(self.grace) => {}
            _ = ctx.cancelled() => {
                let _ = child.kill().await;
                return Err(RelayError::Cancelled);
            }
        }

        tracker.spawn(supervise(ctx, child, self.command.clone()));
        Ok(())
    }
}

async fn supervise(ctx: CancellationToken, mut child: Child, command: String) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => error!(%command, %status, "relay client exited"),
            Err(e) => error!(%command, "relay client wait failed: {}", e),
        },
        _ = ctx.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(%command, "failed to stop relay client: {}", e);
            }
            info!(%command, "relay client stopped");
        }
    }
}

/// Relay errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("failed to run {0}: {1}")]
    Spawn(String, String),

    #[error("relay client exited during start-up ({0})")]
    Exited(String),

    #[error("cancelled during start-up")]
    Cancelled,

    #[error("no relay client configured")]
    NotConfigured,
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_render_args() {
        let relay = CommandRelay::from_options(&RelayOptions::new("DE"));
        let args = relay.render_args(addr("127.0.0.1:40001"), addr("0.0.0.0:8086"), "DE");

        assert_eq!(
            args,
            vec![
                "--upstream-proxy",
                "socks5://127.0.0.1:40001",
                "--listen",
                "0.0.0.0:8086",
                "--country",
                "DE"
            ]
        );
    }

    #[tokio::test]
    async fn test_long_running_child_starts() {
        let ctx = CancellationToken::new();
        let tracker = TaskTracker::new();
        let relay = CommandRelay::new("sleep", vec!["30".into()])
            .with_grace(Duration::from_millis(200));

        relay.start(ctx.clone(), &tracker, addr("127.0.0.1:1"), addr("127.0.0.1:2"), "DE").await.unwrap();
        assert_eq!(tracker.len(), 1);

        ctx.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_failure() {
        let relay = CommandRelay::new("false", Vec::new())
            .with_grace(Duration::from_secs(5));

        let result = relay.start(CancellationToken::new(), &TaskTracker::new(), addr("127.0.0.1:1"), addr("127.0.0.1:2"), "DE").await;
        assert!(matches!(result, Err(RelayError::Exited(_))));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let relay = CommandRelay::new("/nonexistent/relay-client", Vec::new());

        let result = relay.start(CancellationToken::new(), &TaskTracker::new(), addr("127.0.0.1:1"), addr("127.0.0.1:2"), "DE").await;
        assert!(matches!(result, Err(RelayError::Spawn(_, _))));
    }
}
