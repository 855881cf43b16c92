//! Local supervision of the proxy process
//!
//! Renders the proxy configuration from the enabled inbounds, writes it to
//! disk and (re)starts the configured binary. Stopping sends SIGTERM first and
//! falls back to SIGKILL once the grace period runs out.

use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::inbound::{Inbound, InboundRepository};
use crate::restart::ProcessRestarter;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Default)]
struct SupervisorState {
    child: Option<Child>,
    /// Configuration the running child was started with
    last_config: Option<String>,
}

impl SupervisorState {
    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

pub struct ProcessSupervisor {
    config: ProcessConfig,
    repo: InboundRepository,
    state: Mutex<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(config: ProcessConfig, repo: InboundRepository) -> Self {
        Self {
            config,
            repo,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_running()
    }

    /// PID of the running child, if any
    pub async fn pid(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        if !state.is_running() {
            return None;
        }
        state.child.as_ref().and_then(|c| c.id())
    }

    /// Render the full proxy configuration as pretty-printed JSON
    pub fn render_config(&self) -> Result<String> {
        let mut root = self.base_config()?;
        let Some(object) = root.as_object_mut() else {
            return Err(Error::process("proxy config template must be a JSON object"));
        };

        let mut inbounds = match object.remove("inbounds") {
            Some(Value::Array(existing)) => existing,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(Error::process("template 'inbounds' must be an array")),
        };
        for inbound in self.repo.list_all()?.iter().filter(|i| i.enable) {
            inbounds.push(inbound_config(inbound)?);
        }
        object.insert("inbounds".to_string(), Value::Array(inbounds));

        serde_json::to_string_pretty(&root)
            .map_err(|e| Error::process(format!("failed to serialize proxy config: {}", e)))
    }

    fn base_config(&self) -> Result<Value> {
        let Some(ref path) = self.config.template_path else {
            return Ok(default_template());
        };
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::process(format!("failed to read template {}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::process(format!("invalid template {}: {}", path, e)))
    }

    async fn write_config(&self, content: &str) -> Result<()> {
        let path = Path::new(&self.config.config_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::process(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(path, content).await.map_err(|e| {
            Error::process(format!("failed to write {}: {}", self.config.config_path, e))
        })
    }

    fn spawn(&self) -> Result<Child> {
        let command = self
            .config
            .command
            .as_deref()
            .ok_or_else(|| Error::process("no proxy command configured"))?;

        let mut cmd = Command::new(command);
        cmd.args(self.config.resolved_args());
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::process(format!("failed to start {}: {}", command, e)))?;
        info!(command, pid = child.id().unwrap_or(0), "Proxy process spawned");
        Ok(child)
    }

    /// SIGTERM, wait for the grace period, then SIGKILL
    async fn stop_child(&self, child: &mut Child) {
        let grace_period = self.config.shutdown_grace_period();

        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to proxy process");

            #[cfg(unix)]
            {
                if unsafe { libc::kill(pid as i32, libc::SIGTERM) } != 0 {
                    let err = std::io::Error::last_os_error();
                    debug!(pid, error = %err, "SIGTERM not delivered");
                }
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Proxy process exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for proxy process to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Stop the proxy process if it is running
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.last_config = None;
        if let Some(child) = state.child.as_mut() {
            self.stop_child(child).await;
        }
        state.child = None;
    }
}

#[async_trait]
impl ProcessRestarter for ProcessSupervisor {
    async fn restart(&self, force_full_reload: bool) -> Result<()> {
        let config = self.render_config()?;
        let mut state = self.state.lock().await;

        if !force_full_reload
            && state.is_running()
            && state.last_config.as_deref() == Some(config.as_str())
        {
            debug!("Proxy configuration unchanged, keeping running process");
            return Ok(());
        }

        self.write_config(&config).await?;

        // The child stays tracked until it has exited, so a restart that is
        // cancelled mid-stop leaves it for the next attempt to stop
        state.last_config = None;
        if let Some(child) = state.child.as_mut() {
            self.stop_child(child).await;
        }
        state.child = None;

        state.child = Some(self.spawn()?);
        state.last_config = Some(config);
        Ok(())
    }
}

/// One entry of the proxy's `inbounds` array
fn inbound_config(inbound: &Inbound) -> Result<Value> {
    let mut entry = Map::new();
    if !inbound.listen.is_empty() {
        entry.insert("listen".to_string(), Value::String(inbound.listen.clone()));
    }
    entry.insert("port".to_string(), json!(inbound.port));
    entry.insert("protocol".to_string(), Value::String(inbound.protocol.clone()));

    for (key, blob) in [
        ("settings", &inbound.settings),
        ("streamSettings", &inbound.stream_settings),
    ] {
        if let Some(value) = parse_blob(&inbound.tag, key, blob)? {
            entry.insert(key.to_string(), value);
        }
    }
    entry.insert("tag".to_string(), Value::String(inbound.tag.clone()));
    if let Some(value) = parse_blob(&inbound.tag, "sniffing", &inbound.sniffing)? {
        entry.insert("sniffing".to_string(), value);
    }

    Ok(Value::Object(entry))
}

fn parse_blob(tag: &str, key: &str, blob: &str) -> Result<Option<Value>> {
    if blob.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(blob)
        .map(Some)
        .map_err(|e| Error::process(format!("invalid {} for {}: {}", key, tag, e)))
}

fn default_template() -> Value {
    json!({
        "log": { "loglevel": "warning" },
        "inbounds": [],
        "outbounds": [
            { "protocol": "freedom", "settings": {} },
            { "protocol": "blackhole", "settings": {}, "tag": "blocked" }
        ],
        "policy": {
            "system": {
                "statsInboundDownlink": true,
                "statsInboundUplink": true
            }
        },
        "routing": {
            "rules": [
                { "type": "field", "ip": ["geoip:private"], "outboundTag": "blocked" }
            ]
        },
        "stats": {}
    })
}
