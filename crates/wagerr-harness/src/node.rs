//! One daemon process: lifecycle, RPC readiness, simulated time.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use wagerr_rpc::RpcClient;

use crate::config::{self, RPC_PASSWORD, RPC_USER};
use crate::error::HarnessError;
use crate::poll::{Probe, Timeouts, poll_until};

const RPC_READY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default grace period for a daemon to exit after the `stop` RPC.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(60);
const KILL_WAIT: Duration = Duration::from_secs(10);

/// How a stop ended. A forced kill is recorded but not fatal unless the
/// caller used [`NodeHandle::stop_expect_graceful`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Graceful,
    Forced,
}

enum ProcessState {
    Stopped,
    Running(Child),
}

pub struct NodeHandle {
    pub index: usize,
    pub datadir: PathBuf,
    pub p2p_port: u16,
    pub rpc_port: u16,
    binary: PathBuf,
    rpc: RpcClient,
    global_args: Vec<String>,
    extra_args: Vec<String>,
    process: Mutex<ProcessState>,
    mocktime: AtomicI64,
    timeouts: Timeouts,
}

impl NodeHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        root: &std::path::Path,
        binary: PathBuf,
        seed: u32,
        global_args: Vec<String>,
        extra_args: Vec<String>,
        initial_mocktime: i64,
        timeouts: Timeouts,
    ) -> Self {
        let rpc_port = config::rpc_port(index, seed);
        let rpc = RpcClient::new(
            &format!("http://127.0.0.1:{rpc_port}"),
            RPC_USER,
            RPC_PASSWORD,
        );
        Self {
            index,
            datadir: config::node_datadir(root, index),
            p2p_port: config::p2p_port(index, seed),
            rpc_port,
            binary,
            rpc,
            global_args,
            extra_args,
            process: Mutex::new(ProcessState::Stopped),
            mocktime: AtomicI64::new(initial_mocktime),
            timeouts,
        }
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    pub fn p2p_addr(&self) -> String {
        format!("127.0.0.1:{}", self.p2p_port)
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.process.lock(), ProcessState::Running(_))
    }

    pub fn local_mocktime(&self) -> i64 {
        self.mocktime.load(Ordering::SeqCst)
    }

    /// Forget the simulated time so the next start uses the wall clock.
    /// Does not touch a running daemon.
    pub fn clear_mocktime(&self) {
        self.mocktime.store(0, Ordering::SeqCst);
    }

    /// Merged argument list: datadir, replayed mocktime, run-wide extras,
    /// per-node extras, then call-site extras.
    fn build_args(&self, call_args: &[String]) -> Vec<String> {
        let mut args = vec![format!("-datadir={}", self.datadir.display())];
        let mocktime = self.local_mocktime();
        if mocktime > 0 {
            args.push(format!("-mocktime={mocktime}"));
        }
        args.extend(self.global_args.iter().cloned());
        args.extend(self.extra_args.iter().cloned());
        args.extend(call_args.iter().cloned());
        args
    }

    /// Spawn the daemon. Fails if it is already running or the binary
    /// cannot be executed; an immediate crash surfaces from
    /// [`NodeHandle::wait_for_rpc_ready`].
    pub fn start(&self, call_args: &[String]) -> Result<(), HarnessError> {
        let mut state = self.process.lock();
        if matches!(*state, ProcessState::Running(_)) {
            return Err(HarnessError::ProcessStart {
                index: self.index,
                binary: self.binary.display().to_string(),
                reason: "already running".into(),
            });
        }

        let args = self.build_args(call_args);
        debug!(node = self.index, ?args, "spawning daemon");
        let stdout = append_log(&self.datadir, "stdout.log")?;
        let stderr = append_log(&self.datadir, "stderr.log")?;
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| HarnessError::ProcessStart {
                index: self.index,
                binary: self.binary.display().to_string(),
                reason: e.to_string(),
            })?;
        *state = ProcessState::Running(child);
        info!(node = self.index, "daemon started");
        Ok(())
    }

    /// True once the process is no longer running; reaps a freshly exited
    /// child as a side effect.
    pub fn has_exited(&self) -> bool {
        let mut state = self.process.lock();
        match &mut *state {
            ProcessState::Stopped => true,
            ProcessState::Running(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(node = self.index, %status, "daemon exited");
                    *state = ProcessState::Stopped;
                    true
                }
                Ok(None) => false,
                Err(_) => false,
            },
        }
    }

    /// Poll the RPC endpoint until it answers. An early process exit is a
    /// start failure, not a timeout.
    pub async fn wait_for_rpc_ready(&self) -> Result<(), HarnessError> {
        let budget = self
            .timeouts
            .budget(RPC_READY_TIMEOUT, Duration::from_millis(250));
        let result = poll_until("rpc ready", budget, move || {
            Box::pin(async move {
                if self.has_exited() {
                    return Err(HarnessError::ProcessStart {
                        index: self.index,
                        binary: self.binary.display().to_string(),
                        reason: "daemon exited during startup".into(),
                    });
                }
                match self.rpc.get_block_count().await {
                    Ok(_) => Ok(Probe::Converged),
                    Err(e) => Ok(Probe::Pending(e.to_string())),
                }
            })
        })
        .await;
        match result {
            Err(HarnessError::ConvergenceTimeout { timeout, .. }) => Err(HarnessError::RpcTimeout {
                index: self.index,
                timeout,
            }),
            other => other,
        }
    }

    /// Ask the daemon to stop via RPC. Pair with [`NodeHandle::finish_stop`];
    /// splitting the two lets a caller stop many nodes concurrently.
    pub async fn begin_stop(&self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.rpc.stop().await {
            debug!(node = self.index, error = %e, "stop rpc failed");
        }
    }

    /// Wait for the process to exit within `drain`, escalating to a kill on
    /// overrun. The kill is recorded, not fatal.
    pub async fn finish_stop(&self, drain: Duration) -> Result<ShutdownKind, HarnessError> {
        if self.has_exited() {
            return Ok(ShutdownKind::Graceful);
        }
        let budget = self.timeouts.budget(drain, Duration::from_millis(100));
        let result = poll_until("daemon exit", budget, move || {
            Box::pin(async move {
                if self.has_exited() {
                    Ok(Probe::Converged)
                } else {
                    Ok(Probe::Pending("process still running".into()))
                }
            })
        })
        .await;
        match result {
            Ok(()) => {
                info!(node = self.index, "daemon stopped");
                Ok(ShutdownKind::Graceful)
            }
            Err(HarnessError::ConvergenceTimeout { .. }) => {
                warn!(node = self.index, "daemon did not exit in time, killing it");
                self.kill().await;
                Ok(ShutdownKind::Forced)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn stop(&self, drain: Duration) -> Result<ShutdownKind, HarnessError> {
        self.begin_stop().await;
        self.finish_stop(drain).await
    }

    /// Like [`NodeHandle::stop`], but a forced kill fails the caller.
    pub async fn stop_expect_graceful(&self, drain: Duration) -> Result<(), HarnessError> {
        match self.stop(drain).await? {
            ShutdownKind::Graceful => Ok(()),
            ShutdownKind::Forced => Err(HarnessError::UngracefulShutdown {
                index: self.index,
                timeout: self.timeouts.scaled(drain),
            }),
        }
    }

    /// Stop then start; on-disk state persists across the restart.
    pub async fn restart(&self, call_args: &[String]) -> Result<(), HarnessError> {
        self.stop(STOP_TIMEOUT).await?;
        self.start(call_args)?;
        self.wait_for_rpc_ready().await
    }

    /// Push simulated time to the daemon. Idempotent on equal values;
    /// moving backwards is refused because the daemon's timestamp
    /// validation would start rejecting blocks. A stopped node only records
    /// the value and replays it via `-mocktime` at the next start.
    pub async fn set_mocktime(&self, timestamp: i64) -> Result<(), HarnessError> {
        let current = self.local_mocktime();
        if timestamp == current {
            return Ok(());
        }
        if timestamp < current {
            return Err(HarnessError::ClockRegression {
                index: self.index,
                current,
                requested: timestamp,
            });
        }
        if self.is_running() {
            self.rpc.set_mocktime(timestamp).await?;
        }
        self.mocktime.store(timestamp, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&self) {
        {
            let mut state = self.process.lock();
            if let ProcessState::Running(child) = &mut *state {
                if let Err(e) = child.start_kill() {
                    warn!(node = self.index, error = %e, "kill failed");
                }
            }
        }
        let deadline = tokio::time::Instant::now() + KILL_WAIT;
        while !self.has_exited() {
            if tokio::time::Instant::now() >= deadline {
                warn!(node = self.index, "daemon survived kill; leaking process");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn append_log(datadir: &std::path::Path, name: &str) -> Result<Stdio, HarnessError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(datadir.join(name))?;
    Ok(Stdio::from(file))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_node(root: &std::path::Path, binary: &str) -> Arc<NodeHandle> {
        crate::config::initialize_datadir(root, 0, 1).unwrap();
        Arc::new(NodeHandle::new(
            0,
            root,
            PathBuf::from(binary),
            1,
            vec!["-globalflag".into()],
            vec!["-nodeflag".into()],
            0,
            Timeouts::default(),
        ))
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_error() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path(), "/nonexistent/wagerrd");
        let err = node.start(&[]).unwrap_err();
        assert!(matches!(err, HarnessError::ProcessStart { index: 0, .. }));
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn mocktime_is_idempotent_and_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path(), "wagerrd");
        // stopped node: value is recorded locally without RPC
        node.set_mocktime(100).await.unwrap();
        node.set_mocktime(100).await.unwrap();
        assert_eq!(node.local_mocktime(), 100);

        let err = node.set_mocktime(50).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::ClockRegression {
                current: 100,
                requested: 50,
                ..
            }
        ));
        assert_eq!(node.local_mocktime(), 100);

        node.clear_mocktime();
        assert_eq!(node.local_mocktime(), 0);
    }

    #[tokio::test]
    async fn stopping_a_stopped_node_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path(), "wagerrd");
        let kind = node.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(kind, ShutdownKind::Graceful);
    }

    #[test]
    fn args_merge_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let node = test_node(tmp.path(), "wagerrd");
        node.mocktime.store(42, Ordering::SeqCst);
        let args = node.build_args(&["-callflag".into()]);
        let datadir_arg = format!("-datadir={}", node.datadir.display());
        assert_eq!(
            args,
            vec![
                datadir_arg,
                "-mocktime=42".to_string(),
                "-globalflag".to_string(),
                "-nodeflag".to_string(),
                "-callflag".to_string(),
            ]
        );
    }
}
