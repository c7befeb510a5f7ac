use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{ChildEvent, CommandSpec, ProcessHandle, ProcessId, ProcessSpawner, SpawnedChild};

/// Grace period between the polite termination request and the hard kill.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Real process spawner backed by `tokio::process`. Streams are piped and
/// pumped into the child's event channel by dedicated reader tasks; a waiter
/// task owns the `Child`, reaps it, and emits the final `Exited` event after
/// both streams have drained.
pub struct OsProcessSpawner;

#[async_trait]
impl ProcessSpawner for OsProcessSpawner {
    async fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedChild, std::io::Error> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Own process group so the kill path can take down any grandchildren
        // the command launcher (npx, npm) forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        info!(
            "spawned process: {} (PID: {:?}) with args: {:?}",
            spec.command, pid, spec.args
        );

        let (tx, rx) = mpsc::unbounded_channel();

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), ChildEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx.clone(), ChildEvent::Stderr));
        }

        let kill_token = CancellationToken::new();
        tokio::spawn(supervise_child(
            child,
            readers,
            tx,
            kill_token.clone(),
            pid,
        ));

        Ok(SpawnedChild {
            handle: Box::new(OsProcessHandle {
                pid,
                kill_token,
            }),
            events: rx,
        })
    }
}

/// Handle to a spawned OS process. `kill` only cancels the waiter's token;
/// the waiter performs the actual termination, which makes repeated kills
/// (and kills racing a natural exit) harmless.
struct OsProcessHandle {
    pid: Option<ProcessId>,
    kill_token: CancellationToken,
}

#[async_trait]
impl ProcessHandle for OsProcessHandle {
    fn id(&self) -> Option<ProcessId> {
        self.pid
    }

    async fn kill(&mut self) {
        self.kill_token.cancel();
    }
}

fn spawn_reader<R>(
    mut stream: R,
    tx: mpsc::UnboundedSender<ChildEvent>,
    wrap: fn(Vec<u8>) -> ChildEvent,
) -> JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Owns the `Child` for its whole life: waits for natural exit or a kill
/// request, drains the readers, then reports the exit exactly once.
async fn supervise_child(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<ChildEvent>,
    kill_token: CancellationToken,
    pid: Option<ProcessId>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_token.cancelled() => {
            terminate(&mut child, pid).await;
            child.wait().await
        }
    };

    // Exited must be the last event: let both stream readers hit EOF first.
    for reader in readers {
        let _ = reader.await;
    }

    let code = match status {
        Ok(status) => {
            info!("process (PID: {:?}) exited with status: {}", pid, status);
            status.code()
        }
        Err(e) => {
            warn!("error waiting for process (PID: {:?}): {}", pid, e);
            None
        }
    };
    let _ = tx.send(ChildEvent::Exited(code));
}

/// Termination with escalation: SIGTERM to the process group, a short grace
/// period, then SIGKILL. ESRCH at any step means the group is already gone.
#[cfg(unix)]
async fn terminate(child: &mut Child, pid: Option<ProcessId>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid as NixPid;

    if let Some(pid) = pid {
        let pgid = NixPid::from_raw(pid as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                info!("sent SIGTERM to process group {}", pid);
                tokio::time::sleep(TERM_GRACE).await;
            }
            Err(nix::errno::Errno::ESRCH) => {
                info!("process group {} already terminated", pid);
                return;
            }
            Err(e) => {
                warn!("failed to send SIGTERM to process group {}: {}", pid, e);
            }
        }
    }

    if let Err(e) = child.start_kill() {
        // InvalidInput here means the child was already reaped.
        info!("kill for PID {:?} not delivered: {}", pid, e);
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, pid: Option<ProcessId>) {
    if let Err(e) = child.start_kill() {
        info!("kill for PID {:?} not delivered: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_then_exit() {
        let spec = CommandSpec::new("sh", ["-c", "printf hello; exit 3"]);
        let mut spawned = OsProcessSpawner.spawn(&spec).await.unwrap();

        let mut stdout = Vec::new();
        let mut exit_code = None;
        while let Some(event) = spawned.events.recv().await {
            match event {
                ChildEvent::Stdout(chunk) => stdout.extend_from_slice(&chunk),
                ChildEvent::Stderr(_) => {}
                ChildEvent::Exited(code) => {
                    exit_code = code;
                    break;
                }
            }
        }
        assert_eq!(stdout, b"hello");
        assert_eq!(exit_code, Some(3));
        assert!(spawned.events.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_produces_exit_event_and_is_idempotent() {
        let spec = CommandSpec::new("sh", ["-c", "sleep 30"]);
        let mut spawned = OsProcessSpawner.spawn(&spec).await.unwrap();

        spawned.handle.kill().await;
        spawned.handle.kill().await;

        let mut saw_exit = false;
        while let Some(event) = spawned.events.recv().await {
            if let ChildEvent::Exited(code) = event {
                // SIGTERM death carries no exit code.
                assert_eq!(code, None);
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[tokio::test]
    async fn missing_executable_fails_synchronously() {
        let spec = CommandSpec::new("portlift-no-such-binary", Vec::<&str>::new());
        let result = OsProcessSpawner.spawn(&spec).await;
        assert!(result.is_err());
    }
}
