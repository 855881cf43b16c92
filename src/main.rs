use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use xpanel::admin::{AdminContext, AdminServer, PKG_NAME, VERSION};
use xpanel::config::Config;
use xpanel::db::Database;
use xpanel::inbound::InboundRepository;
use xpanel::quota::QuotaSweeper;
use xpanel::restart::{ProcessRestarter, RestartCoordinator};
use xpanel::scheduler::{spawn_quota_sweep_loop, spawn_restart_loop};
use xpanel::service::InboundService;
use xpanel::supervisor::ProcessSupervisor;
use xpanel::traffic::TrafficAccumulator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xpanel=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let db = Database::open(&config.database.path)?;
    info!(path = %config.database.path, schema_version = db.schema_version()?, "Database opened");

    let repo = InboundRepository::new(db.clone());
    let coordinator = Arc::new(RestartCoordinator::new(config.supervisor.restart_timeout()));
    let supervisor = Arc::new(ProcessSupervisor::new(config.process.clone(), repo.clone()));
    let service = InboundService::new(repo, Arc::clone(&coordinator));

    // Bring the proxy up with the stored inbounds
    if let Err(e) = coordinator.restart_now(supervisor.as_ref(), true).await {
        error!(error = %e, "Initial start of proxy process failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let context = Arc::new(AdminContext::new(
        service,
        TrafficAccumulator::new(db.clone()),
        Arc::clone(&coordinator),
        Arc::clone(&supervisor),
        admin_token,
    ));
    let admin_server = AdminServer::new(admin_addr, context, shutdown_rx.clone());

    let restarter: Arc<dyn ProcessRestarter> = supervisor.clone();
    let restart_handle = spawn_restart_loop(
        Arc::clone(&coordinator),
        restarter,
        config.supervisor.restart_interval(),
        shutdown_rx.clone(),
    );
    let sweep_handle = spawn_quota_sweep_loop(
        QuotaSweeper::new(db),
        Arc::clone(&coordinator),
        config.supervisor.sweep_interval(),
        shutdown_rx.clone(),
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP forces a restart
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, restarting proxy process...");
                    if let Err(e) = coordinator.restart_now(supervisor.as_ref(), true).await {
                        error!(error = %e, "Failed to restart proxy process");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Let a running tick finish before stopping the process
    let _ = tokio::time::timeout(config.supervisor.restart_timeout() + Duration::from_secs(1), async {
        let _ = restart_handle.await;
        let _ = sweep_handle.await;
    })
    .await;

    info!("Stopping proxy process...");
    supervisor.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Truncate only once the lock is held
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting panel");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.database.path,
        "Server configuration"
    );
    info!(
        restart_interval_secs = config.supervisor.restart_interval_secs,
        sweep_interval_secs = config.supervisor.sweep_interval_secs,
        restart_timeout_secs = config.supervisor.restart_timeout_secs,
        "Supervisor settings"
    );
    info!(
        command = config.process.command.as_deref().unwrap_or(""),
        config_path = %config.process.config_path,
        template = config.process.template_path.as_deref().unwrap_or("built-in"),
        shutdown_grace_period_secs = config.process.shutdown_grace_period_secs,
        "Proxy process settings"
    );
}
