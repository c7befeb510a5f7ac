use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    ChildProcess, ChildState, CliInstaller, Installer, OsProcessSpawner, OutputRelay,
    ProcessSpawner, PublicEndpoint, StreamSink, SupervisorConfig, SupervisorError,
};

/// Supervisor lifecycle states. Exactly one supervisor instance owns the
/// state; event handlers request transitions, they never transition
/// concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Installing,
    StartingService,
    StartingTunnel,
    Running,
    ShuttingDown,
    Terminated,
}

/// What ended the run. Fixed exactly once; later triggers are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// External interrupt (ctrl-c) delivered to the supervisor.
    Interrupt,
    /// The service process exited on its own.
    ServiceExited(Option<i32>),
    /// The tunnel process exited on its own.
    TunnelExited(Option<i32>),
}

impl ShutdownReason {
    /// Supervisor exit code: 0 for a user interrupt, the triggering child's
    /// own code otherwise. A signal-killed child has no code; that is an
    /// abnormal end, so it maps to 1.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Interrupt => 0,
            ShutdownReason::ServiceExited(code) | ShutdownReason::TunnelExited(code) => {
                code.unwrap_or(1)
            }
        }
    }
}

/// Result of a completed supervisor run.
#[derive(Debug)]
pub struct RunOutcome {
    pub reason: ShutdownReason,
    pub exit_code: i32,
    pub endpoint: Option<PublicEndpoint>,
}

/// Top-level orchestrator: installer, then service, then (after the settle
/// delay) the tunnel; any termination trigger tears both children down.
///
/// After `run` returns, no spawned child is left running - shutdown is
/// unconditional and total.
pub struct LifecycleSupervisor {
    config: SupervisorConfig,
    spawner: Box<dyn ProcessSpawner>,
    installer: Box<dyn Installer>,
    shutdown: CancellationToken,
    out: StreamSink,
    err: StreamSink,
    state: SupervisorState,
    endpoint: Option<PublicEndpoint>,
}

impl LifecycleSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let installer = Box::new(CliInstaller::new(config.install.clone()));
        Self::with_parts(
            config,
            Box::new(OsProcessSpawner),
            installer,
            StreamSink::stdout(),
            StreamSink::stderr(),
        )
    }

    /// Fully injectable constructor; tests supply fake spawners, installers
    /// and in-memory sinks.
    pub fn with_parts(
        config: SupervisorConfig,
        spawner: Box<dyn ProcessSpawner>,
        installer: Box<dyn Installer>,
        out: StreamSink,
        err: StreamSink,
    ) -> Self {
        Self {
            config,
            spawner,
            installer,
            shutdown: CancellationToken::new(),
            out,
            err,
            state: SupervisorState::Idle,
            endpoint: None,
        }
    }

    /// Token that triggers graceful shutdown when cancelled. Cancelling more
    /// than once is a no-op, so repeated interrupts collapse into a single
    /// shutdown sequence.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run to completion. `Err` means a fatal precondition failure (install
    /// or spawn); `Ok` carries the exit code to propagate. Every path ends
    /// in `Terminated`, fatal ones included.
    pub async fn run(&mut self) -> Result<RunOutcome, SupervisorError> {
        self.transition(SupervisorState::Installing);
        if let Err(error) = self.installer.ensure_available().await {
            self.transition(SupervisorState::Terminated);
            return Err(error);
        }

        self.transition(SupervisorState::StartingService);
        let spawned = match self.spawner.spawn(&self.config.service).await {
            Ok(spawned) => spawned,
            Err(source) => {
                let command = self.config.service.command.clone();
                self.transition(SupervisorState::Terminated);
                return Err(SupervisorError::SpawnFailed {
                    role: "service",
                    command,
                    source,
                });
            }
        };
        let mut service = ChildProcess::new("service", spawned);
        let mut service_relay = OutputRelay::new(self.out.clone(), self.err.clone());

        // Settle delay: give the service time to bind its port before the
        // tunnel tries to reach it. Service output keeps flowing meanwhile,
        // and an early service exit or interrupt ends the run without the
        // tunnel ever starting.
        if let Some(reason) = self.settle(&mut service, &mut service_relay).await {
            self.transition(SupervisorState::ShuttingDown);
            kill_and_drain(&mut service, &mut service_relay).await;
            return Ok(self.finish(reason));
        }

        self.transition(SupervisorState::StartingTunnel);
        let spawned = match self.spawner.spawn(&self.config.tunnel).await {
            Ok(spawned) => spawned,
            Err(source) => {
                // Fatal, but the running sibling must not be orphaned.
                self.transition(SupervisorState::ShuttingDown);
                kill_and_drain(&mut service, &mut service_relay).await;
                self.transition(SupervisorState::Terminated);
                return Err(SupervisorError::SpawnFailed {
                    role: "tunnel",
                    command: self.config.tunnel.command.clone(),
                    source,
                });
            }
        };
        let mut tunnel = ChildProcess::new("tunnel", spawned);
        let mut tunnel_relay = OutputRelay::with_extractor(self.out.clone(), self.err.clone());

        self.transition(SupervisorState::Running);
        let reason = self
            .supervise(
                &mut service,
                &mut service_relay,
                &mut tunnel,
                &mut tunnel_relay,
            )
            .await;

        Ok(self.finish(reason))
    }

    /// Wait out the settle delay while relaying service output. Returns a
    /// shutdown reason if the run ends before the delay does.
    async fn settle(
        &mut self,
        service: &mut ChildProcess,
        relay: &mut OutputRelay,
    ) -> Option<ShutdownReason> {
        let shutdown = self.shutdown.clone();
        let settle = tokio::time::sleep(self.config.settle_delay());
        tokio::pin!(settle);

        loop {
            tokio::select! {
                _ = &mut settle => return None,
                _ = shutdown.cancelled() => {
                    info!("interrupt received before tunnel start, shutting down");
                    return Some(ShutdownReason::Interrupt);
                }
                event = service.next_event() => {
                    if let Some(event) = &event {
                        relay.forward(event).await;
                    }
                    if let ChildState::Exited(code) = service.state() {
                        warn!("service exited with code {:?} before tunnel start", code);
                        return Some(ShutdownReason::ServiceExited(code));
                    }
                }
            }
        }
    }

    /// Main joint-lifecycle loop: relay output from both children, watch for
    /// the first shutdown trigger, then kill both and drain until both exits
    /// are confirmed.
    async fn supervise(
        &mut self,
        service: &mut ChildProcess,
        service_relay: &mut OutputRelay,
        tunnel: &mut ChildProcess,
        tunnel_relay: &mut OutputRelay,
    ) -> ShutdownReason {
        let shutdown = self.shutdown.clone();
        let mut reason: Option<ShutdownReason> = None;

        loop {
            if reason.is_some() && service.has_exited() && tunnel.has_exited() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled(), if reason.is_none() => {
                    info!("interrupt received, shutting down both processes");
                    reason = Some(ShutdownReason::Interrupt);
                    self.begin_shutdown(service, tunnel).await;
                }
                event = service.next_event(), if !service.has_exited() => {
                    if let Some(event) = &event {
                        service_relay.forward(event).await;
                    }
                    if let ChildState::Exited(code) = service.state() {
                        if reason.is_none() {
                            info!("service exited with code {:?}", code);
                            reason = Some(ShutdownReason::ServiceExited(code));
                            self.begin_shutdown(service, tunnel).await;
                        }
                    }
                }
                event = tunnel.next_event(), if !tunnel.has_exited() => {
                    if let Some(event) = &event {
                        if let Some(endpoint) = tunnel_relay.forward(event).await {
                            self.announce(endpoint);
                        }
                    }
                    if let ChildState::Exited(code) = tunnel.state() {
                        if reason.is_none() {
                            info!("tunnel exited with code {:?}", code);
                            reason = Some(ShutdownReason::TunnelExited(code));
                            self.begin_shutdown(service, tunnel).await;
                        }
                    }
                }
            }
        }

        // reason is always set before both-exited can hold.
        reason.unwrap_or(ShutdownReason::Interrupt)
    }

    /// Kill both children. The trigger child is usually already dead; its
    /// kill is a no-op by contract.
    async fn begin_shutdown(&mut self, service: &mut ChildProcess, tunnel: &mut ChildProcess) {
        self.transition(SupervisorState::ShuttingDown);
        service.kill().await;
        tunnel.kill().await;
    }

    fn announce(&mut self, endpoint: PublicEndpoint) {
        // First match wins; the extractor latches, this is belt and braces.
        if self.endpoint.is_some() {
            return;
        }
        info!("public endpoint ready: {}", endpoint.url());
        info!(
            "share this URL to reach the local service on port {}",
            self.config.port
        );
        self.endpoint = Some(endpoint);
    }

    fn finish(&mut self, reason: ShutdownReason) -> RunOutcome {
        if self.endpoint.is_none() {
            info!("no public endpoint was discovered during this run");
        }
        self.transition(SupervisorState::Terminated);
        let exit_code = reason.exit_code();
        info!("supervisor terminated: {:?}, exit code {}", reason, exit_code);
        RunOutcome {
            reason,
            exit_code,
            endpoint: self.endpoint.take(),
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!("supervisor state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Kill one child and relay its remaining output until the exit is
/// confirmed. Used on the paths where only the service is alive.
async fn kill_and_drain(child: &mut ChildProcess, relay: &mut OutputRelay) {
    child.kill().await;
    while !child.has_exited() {
        match child.next_event().await {
            Some(event) => {
                relay.forward(&event).await;
            }
            None => break,
        }
    }
}
