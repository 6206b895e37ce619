//! Spawning and terminating backend processes
//!
//! Every backend runs under the system shell in its own process group, so a
//! launch command that forks (`npm start`, wrapper scripts, ...) can be
//! stopped as a unit. Termination is two-staged: a soft stop to the whole
//! group, then a hard kill once the grace period runs out.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for the kernel to reap a hard-killed process
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Platform capability used by the process manager.
///
/// `terminate` is best-effort: it logs what happened and always completes.
pub trait ProcessController: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Launch `command` through the shell in a new process group
    fn spawn(&self, command: &str) -> Result<Self::Handle, ControlError>;

    /// Soft-stop the process group, escalating to a hard kill after `grace_period`
    fn terminate(
        &self,
        handle: Self::Handle,
        grace_period: Duration,
    ) -> impl Future<Output = ()> + Send;

    /// OS process id, for logging and status
    fn pid(&self, _handle: &Self::Handle) -> Option<u32> {
        None
    }
}

/// Runs entrypoints with `sh -c` (unix) or `cmd /C` (windows)
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellController;

impl ProcessController for ShellController {
    type Handle = Child;

    fn spawn(&self, command: &str) -> Result<Child, ControlError> {
        let mut cmd = shell_command(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ControlError::Spawn {
            command: command.to_string(),
            source,
        })?;

        info!(pid = child.id(), command, "Backend process spawned");
        Ok(child)
    }

    fn terminate(&self, child: Child, grace_period: Duration) -> impl Future<Output = ()> + Send {
        terminate_child(child, grace_period)
    }

    fn pid(&self, child: &Child) -> Option<u32> {
        child.id()
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    // pgid == pid of the shell
    cmd.process_group(0);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    cmd
}

async fn terminate_child(mut child: Child, grace_period: Duration) {
    let Some(pid) = child.id() else {
        debug!("Process already reaped, nothing to terminate");
        return;
    };

    info!(pgid = pid, "Sending soft stop to process group");
    if let Err(e) = soft_stop(&mut child, pid).await {
        debug!(pgid = pid, error = %e, "Soft stop failed");
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pgid = pid, ?status, "Backend process exited after soft stop");
            if group_alive(pid) {
                warn!(pgid = pid, "Process group outlived its leader, sending hard kill");
                if let Err(e) = hard_kill(&mut child, pid).await {
                    warn!(pgid = pid, error = %e, "Failed to kill remaining group members");
                }
            }
        }
        Ok(Err(e)) => {
            warn!(pgid = pid, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                pgid = pid,
                grace_period_ms = grace_period.as_millis() as u64,
                "Grace period exceeded, sending hard kill"
            );
            if let Err(e) = hard_kill(&mut child, pid).await {
                warn!(pgid = pid, error = %e, "Hard kill failed");
            }

            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => info!(pgid = pid, ?status, "Backend process killed"),
                Ok(Err(e)) => warn!(pgid = pid, error = %e, "Error reaping killed backend"),
                Err(_) => error!(pgid = pid, "Backend process did not exit after hard kill"),
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
async fn soft_stop(_child: &mut Child, pgid: u32) -> std::io::Result<()> {
    signal_group(pgid, libc::SIGINT)
}

#[cfg(unix)]
async fn hard_kill(child: &mut Child, pgid: u32) -> std::io::Result<()> {
    match signal_group(pgid, libc::SIGKILL) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Group already gone; make sure the leader is not left behind
            let _ = child.start_kill();
            Err(e)
        }
    }
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    signal_group(pgid, 0).is_ok()
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) -> std::io::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        cmd.arg("/F");
    }
    let output = cmd.stdout(Stdio::null()).stderr(Stdio::null()).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {}", output.status)))
    }
}

#[cfg(windows)]
async fn soft_stop(_child: &mut Child, pid: u32) -> std::io::Result<()> {
    taskkill(pid, false).await
}

#[cfg(windows)]
async fn hard_kill(child: &mut Child, pid: u32) -> std::io::Result<()> {
    let result = taskkill(pid, true).await;
    let _ = child.start_kill();
    result
}

#[cfg(windows)]
fn group_alive(_pid: u32) -> bool {
    false
}
