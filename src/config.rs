use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// One spawnable command: program, arguments, working directory, environment.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option))]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    pub command: String,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub args: Vec<String>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    pub fn builder() -> CommandSpecBuilder {
        CommandSpecBuilder::default()
    }

    pub fn new<S: ToString, I: IntoIterator<Item = S>>(command: S, args: I) -> Self {
        Self {
            command: command.to_string(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
            working_directory: None,
            env: HashMap::new(),
        }
    }

    /// Parse a whitespace-separated command line, e.g. `"node server.js"`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let command = parts.next()?.to_string();
        Some(Self {
            command,
            args: parts.map(str::to_string).collect(),
            working_directory: None,
            env: HashMap::new(),
        })
    }
}

impl CommandSpecBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Configuration for the one-shot dependency install step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    /// Binary name probed on PATH to decide whether the relay CLI is present.
    pub probe: String,
    /// Package-fetch command run when the probe fails.
    pub fetch: CommandSpec,
    /// Treat the dependency as present without probing.
    #[serde(default)]
    pub skip: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            probe: default_probe(),
            fetch: CommandSpec::new("npm", ["install", "ngrok@5.0.0", "--no-save"]),
            skip: false,
        }
    }
}

/// Main supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option), default)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Launch command for the local application process.
    pub service: CommandSpec,
    /// Launch command for the tunnel-relay CLI.
    pub tunnel: CommandSpec,
    /// Dependency install step for the relay CLI.
    #[serde(default)]
    pub install: InstallConfig,
    /// Local port the service binds and the tunnel exposes.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pause between starting the service and starting the tunnel (in
    /// milliseconds), giving the service time to bind its port.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl SupervisorConfig {
    pub fn builder() -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::default()
    }

    /// Defaults matching the stock deployment: `node server.js` exposed
    /// through `npx ngrok http <port> --log=stdout`.
    pub fn for_port(port: u16) -> Self {
        Self {
            service: CommandSpec::new("node", ["server.js"]),
            tunnel: CommandSpec::new(
                "npx",
                ["ngrok", "http", &port.to_string(), "--log=stdout"],
            ),
            install: InstallConfig::default(),
            port,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.service.command.is_empty() {
            return Err("service command must not be empty".to_string());
        }
        if self.tunnel.command.is_empty() {
            return Err("tunnel command must not be empty".to_string());
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::for_port(default_port())
    }
}

// Default value functions for serde
fn default_port() -> u16 {
    3000
}
fn default_settle_delay_ms() -> u64 {
    3000
}
fn default_probe() -> String {
    "ngrok".to_string()
}
