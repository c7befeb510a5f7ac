use clap::Parser;
use portlift::{CommandSpec, LifecycleSupervisor, SupervisorConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Expose a local web service to the public internet through a tunnel relay,
/// keeping the service and the relay alive and dead together.
#[derive(Parser, Debug)]
#[command(name = "portlift", version, about)]
struct Cli {
    /// Local port the service binds and the tunnel exposes
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Launch command for the local service, whitespace-separated
    #[arg(long, default_value = "node server.js")]
    service_command: String,

    /// Launch command for the tunnel relay; defaults to
    /// `npx ngrok http <port> --log=stdout`
    #[arg(long)]
    tunnel_command: Option<String>,

    /// Milliseconds to wait between service start and tunnel start
    #[arg(long, default_value_t = 3000)]
    settle_ms: u64,

    /// Skip the relay CLI install check
    #[arg(long)]
    skip_install: bool,
}

impl Cli {
    fn into_config(self) -> Result<SupervisorConfig, String> {
        let mut config = SupervisorConfig::for_port(self.port);
        config.service = CommandSpec::parse(&self.service_command)
            .ok_or_else(|| "service command must not be empty".to_string())?;
        if let Some(tunnel) = &self.tunnel_command {
            config.tunnel = CommandSpec::parse(tunnel)
                .ok_or_else(|| "tunnel command must not be empty".to_string())?;
        }
        config.settle_delay_ms = self.settle_ms;
        config.install.skip = self.skip_install;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(message) => {
            error!("invalid configuration: {message}");
            std::process::exit(portlift::EXIT_FATAL);
        }
    };

    info!(
        "starting supervisor: service '{}', tunnel '{}', port {}",
        config.service.command, config.tunnel.command, config.port
    );

    let mut supervisor = LifecycleSupervisor::new(config);

    // Ctrl-c cancels the shutdown token; further interrupts are no-ops
    // because the token only cancels once.
    let shutdown = supervisor.shutdown_token();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            shutdown.cancel();
        }
    });

    match supervisor.run().await {
        Ok(outcome) => std::process::exit(outcome.exit_code),
        Err(error) => {
            error!("fatal: {error}");
            std::process::exit(error.exit_code());
        }
    }
}
