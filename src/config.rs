use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the panel
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Record store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Restart tick and quota sweep cadence
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// The supervised proxy process
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 54321)
    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Bearer token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file (default: ./xpanel.db)
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Seconds between restart ticks (default: 10)
    #[serde(default = "default_restart_interval")]
    pub restart_interval_secs: u64,

    /// Seconds between quota/expiry sweeps (default: 10)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound for one restart of the proxy process (default: 30)
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout_secs: u64,
}

impl SupervisorConfig {
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_interval_secs: default_restart_interval(),
            sweep_interval_secs: default_sweep_interval(),
            restart_timeout_secs: default_restart_timeout(),
        }
    }
}

/// Configuration for the supervised proxy process
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Proxy binary to run
    pub command: Option<String>,

    /// Arguments; `{config}` is replaced with `config_path`
    #[serde(default = "default_process_args")]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Where the rendered proxy configuration is written
    #[serde(default = "default_process_config_path")]
    pub config_path: String,

    /// JSON file used as the base of the rendered configuration
    pub template_path: Option<String>,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ProcessConfig {
    /// Create a process config for the given command with defaults
    pub fn new(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Arguments with the config placeholder substituted
    pub fn resolved_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace("{config}", &self.config_path))
            .collect()
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: default_process_args(),
            working_dir: None,
            env: HashMap::new(),
            config_path: default_process_config_path(),
            template_path: None,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    54321
}

fn default_database_path() -> String {
    "./xpanel.db".to_string()
}

fn default_restart_interval() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_restart_timeout() -> u64 {
    30
}

fn default_process_args() -> Vec<String> {
    vec!["-c".to_string(), "{config}".to_string()]
}

fn default_process_config_path() -> String {
    "./bin/config.json".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.process.command.as_deref() {
            None | Some("") => anyhow::bail!("[process] requires a 'command'"),
            Some(_) => {}
        }

        if self.process.config_path.is_empty() {
            anyhow::bail!("[process] 'config_path' must not be empty");
        }

        if self.supervisor.restart_interval_secs == 0 {
            anyhow::bail!("[supervisor] 'restart_interval_secs' must be greater than 0");
        }

        if self.supervisor.sweep_interval_secs == 0 {
            anyhow::bail!("[supervisor] 'sweep_interval_secs' must be greater than 0");
        }

        if self.supervisor.restart_timeout_secs == 0 {
            anyhow::bail!("[supervisor] 'restart_timeout_secs' must be greater than 0");
        }

        if self.process.shutdown_grace_period_secs >= self.supervisor.restart_timeout_secs {
            anyhow::bail!(
                "[process] 'shutdown_grace_period_secs' ({}) must be less than [supervisor] 'restart_timeout_secs' ({})",
                self.process.shutdown_grace_period_secs,
                self.supervisor.restart_timeout_secs
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 2053
admin_token = "secret"
pid_file = "/run/xpanel.pid"

[database]
path = "/etc/xpanel/xpanel.db"

[supervisor]
restart_interval_secs = 5
sweep_interval_secs = 30
restart_timeout_secs = 60

[process]
command = "/usr/local/bin/xray"
args = ["run", "-config", "{config}"]
config_path = "/etc/xpanel/config.json"
template_path = "/etc/xpanel/template.json"
shutdown_grace_period_secs = 2

[process.env]
XRAY_LOCATION_ASSET = "/usr/local/share/xray"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 2053);
        assert_eq!(config.server.admin_token, Some("secret".to_string()));
        assert_eq!(config.database.path, "/etc/xpanel/xpanel.db");
        assert_eq!(config.supervisor.restart_interval(), Duration::from_secs(5));
        assert_eq!(config.supervisor.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.supervisor.restart_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.process.resolved_args(),
            vec!["run", "-config", "/etc/xpanel/config.json"]
        );
        assert_eq!(config.process.shutdown_grace_period(), Duration::from_secs(2));
        assert_eq!(
            config.process.env.get("XRAY_LOCATION_ASSET"),
            Some(&"/usr/local/share/xray".to_string())
        );
    }

    #[test]
    fn test_minimal_config() {
        let toml = r#"
[process]
command = "xray"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 54321);
        assert!(config.server.admin_token.is_none());
        assert_eq!(config.database.path, "./xpanel.db");
        assert_eq!(config.supervisor.restart_interval_secs, 10);
        assert_eq!(config.supervisor.sweep_interval_secs, 10);
        assert_eq!(config.supervisor.restart_timeout_secs, 30);
        assert_eq!(config.process.resolved_args(), vec!["-c", "./bin/config.json"]);
        assert_eq!(config.process.shutdown_grace_period_secs, 5);
    }

    #[test]
    fn test_empty_config_fails_validation() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut config = Config {
            process: ProcessConfig::new("xray"),
            ..Default::default()
        };
        config.validate().unwrap();

        config.supervisor.restart_interval_secs = 0;
        assert!(config.validate().is_err());

        config.supervisor.restart_interval_secs = 10;
        config.supervisor.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        config.supervisor.sweep_interval_secs = 10;
        config.supervisor.restart_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_grace_period_must_fit_restart_timeout() {
        let toml = r#"
[supervisor]
restart_timeout_secs = 3

[process]
command = "xray"
shutdown_grace_period_secs = 3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shutdown_grace_period_secs"));

        let mut config = config;
        config.process.shutdown_grace_period_secs = 2;
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[process]\ncommand = \"xray\"\n[server]\nport = 8080").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.process.command, Some("xray".to_string()));
    }
}
