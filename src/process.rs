use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::CommandSpec;

/// Unique identifier for a process
pub type ProcessId = u32;

/// One event observed on a supervised child: an output chunk from either
/// captured stream, or the OS-level exit. Chunks arrive in delivery order
/// with no guaranteed alignment to line boundaries. `Exited` is sent exactly
/// once, last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(Option<i32>),
}

/// Lifecycle state of one supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Running,
    Exited(Option<i32>),
}

/// Handle to a running OS process. Implementations must make `kill`
/// idempotent: killing an already-exited or already-killed process is a
/// no-op, never an error.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Process ID, if the process ever started (None for test fakes).
    fn id(&self) -> Option<ProcessId>;

    /// Request termination. Must be safe to call any number of times.
    async fn kill(&mut self);
}

/// A freshly spawned child: its handle plus the event stream carrying its
/// output chunks and, finally, its exit.
pub struct SpawnedChild {
    pub handle: Box<dyn ProcessHandle>,
    pub events: mpsc::UnboundedReceiver<ChildEvent>,
}

/// Seam between the supervisor's transition logic and the OS. The real
/// implementation spawns processes with captured stdio; tests inject fakes
/// that script events without spawning anything.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Spawn a child from the given spec. Output streams must be captured
    /// (piped, not inherited) and buffered into the event channel from the
    /// moment the handle exists, so no early output is lost.
    async fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedChild, std::io::Error>;
}

/// Wrapper owning one child's handle and event stream, tracking its
/// lifecycle state as exit events are observed.
pub struct ChildProcess {
    role: &'static str,
    handle: Box<dyn ProcessHandle>,
    events: mpsc::UnboundedReceiver<ChildEvent>,
    state: ChildState,
}

impl ChildProcess {
    pub fn new(role: &'static str, spawned: SpawnedChild) -> Self {
        Self {
            role,
            handle: spawned.handle,
            events: spawned.events,
            state: ChildState::Running,
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn id(&self) -> Option<ProcessId> {
        self.handle.id()
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn has_exited(&self) -> bool {
        matches!(self.state, ChildState::Exited(_))
    }

    /// Receive the next event, recording the exit transition. Returns `None`
    /// once the event channel is closed; a channel that closes without an
    /// exit event counts as an exit with unknown code (the event source is
    /// gone, so the child can no longer be observed).
    pub async fn next_event(&mut self) -> Option<ChildEvent> {
        match self.events.recv().await {
            Some(event) => {
                if let ChildEvent::Exited(code) = &event {
                    self.state = ChildState::Exited(*code);
                }
                Some(event)
            }
            None => {
                if !self.has_exited() {
                    self.state = ChildState::Exited(None);
                }
                None
            }
        }
    }

    /// Kill the underlying process. No-op when the exit was already
    /// observed; always safe to call more than once.
    pub async fn kill(&mut self) {
        if self.has_exited() {
            return;
        }
        self.handle.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandle {
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProcessHandle for CountingHandle {
        fn id(&self) -> Option<ProcessId> {
            None
        }

        async fn kill(&mut self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scripted_child(events: Vec<ChildEvent>, kills: Arc<AtomicUsize>) -> ChildProcess {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        drop(tx);
        ChildProcess::new(
            "service",
            SpawnedChild {
                handle: Box::new(CountingHandle { kills }),
                events: rx,
            },
        )
    }

    #[tokio::test]
    async fn exit_event_transitions_state() {
        let kills = Arc::new(AtomicUsize::new(0));
        let mut child = scripted_child(
            vec![ChildEvent::Stdout(b"ready\n".to_vec()), ChildEvent::Exited(Some(2))],
            kills,
        );
        assert_eq!(child.state(), ChildState::Running);
        assert_eq!(
            child.next_event().await,
            Some(ChildEvent::Stdout(b"ready\n".to_vec()))
        );
        assert_eq!(child.next_event().await, Some(ChildEvent::Exited(Some(2))));
        assert_eq!(child.state(), ChildState::Exited(Some(2)));
        assert_eq!(child.next_event().await, None);
    }

    #[tokio::test]
    async fn kill_after_observed_exit_is_noop() {
        let kills = Arc::new(AtomicUsize::new(0));
        let mut child = scripted_child(vec![ChildEvent::Exited(Some(0))], kills.clone());
        child.next_event().await;
        child.kill().await;
        child.kill().await;
        assert_eq!(kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn kill_twice_while_running_reaches_handle_each_time() {
        let kills = Arc::new(AtomicUsize::new(0));
        let mut child = scripted_child(vec![], kills.clone());
        child.kill().await;
        child.kill().await;
        // Idempotence is the handle's contract; the wrapper only suppresses
        // kills after the exit event was observed.
        assert_eq!(kills.load(Ordering::SeqCst), 2);
    }
}
