//! # parley-gateway
//!
//! Parley gateway binary: loads settings, opens the call store, picks a
//! fanout broker and serves WebSocket plus HTTP until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parley_calls::{CallStore, ConnectionConfig};
use parley_server::context::Collaborators;
use parley_server::fanout::{MemoryHub, RedisBroker};
use parley_server::push::LogPushSender;
use parley_server::{AppContext, FanoutAdapter, JwtVerifier, ParleyServer, ServerConfig};
use parley_settings::loader::parley_home;
use parley_settings::{FanoutBackend, ParleySettings};
use tracing::{info, warn};

/// Parley realtime gateway.
#[derive(Parser, Debug)]
#[command(name = "parley-gateway", about = "Parley realtime gateway")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.parley/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the `SQLite` database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Redis URL. Implies the redis fanout backend.
    #[arg(long)]
    redis_url: Option<String>,

    /// Minimum log level.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn settings_file(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(parley_settings::settings_path)
    }

    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut ParleySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.db_path {
            settings.database.path = path.to_string_lossy().into_owned();
        }
        if let Some(url) = &self.redis_url {
            settings.fanout.backend = FanoutBackend::Redis;
            settings.fanout.redis_url.clone_from(url);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Relative database paths live under `~/.parley`.
fn resolve_db_path(path: &str) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        parley_home().join(path)
    }
}

fn open_store(settings: &ParleySettings) -> Result<CallStore> {
    let db_path = resolve_db_path(&settings.database.path);
    ensure_parent_dir(&db_path)?;
    let db_str = db_path.to_string_lossy();
    let config = ConnectionConfig {
        pool_size: settings.database.pool_size,
        busy_timeout_ms: settings.database.busy_timeout_ms,
    };
    let pool = parley_calls::new_file(&db_str, &config)
        .with_context(|| format!("Failed to open database: {db_str}"))?;
    let store = CallStore::new(pool);
    let applied = store
        .migrate()
        .context("Failed to run database migrations")?;
    info!(path = %db_str, applied, "call store ready");
    Ok(store)
}

async fn build_fanout(settings: &ParleySettings) -> Result<FanoutAdapter> {
    let prefix = settings.fanout.channel_prefix.clone();
    let ttl = Duration::from_secs(settings.presence.ttl_secs);
    let adapter = match settings.fanout.backend {
        FanoutBackend::Memory => {
            let (broker, inbound) = MemoryHub::new().connect();
            FanoutAdapter::new(Arc::new(broker), inbound, prefix, ttl)
        }
        FanoutBackend::Redis => {
            let (broker, inbound) = RedisBroker::connect(&settings.fanout.redis_url)
                .await
                .with_context(|| {
                    format!("Failed to connect to redis at {}", settings.fanout.redis_url)
                })?;
            FanoutAdapter::new(Arc::new(broker), inbound, prefix, ttl)
        }
        FanoutBackend::Disabled => FanoutAdapter::disabled(prefix),
    };
    Ok(adapter)
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings_file();
    let mut settings = parley_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    parley_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    if parley_settings::init_settings(settings.clone()).is_err() {
        warn!("global settings already initialized");
    }

    let metrics = match parley_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let store = open_store(&settings)?;
    let fanout = build_fanout(&settings).await?;
    info!(backend = ?settings.fanout.backend, instance_id = %fanout.instance_id(), "fanout ready");

    let verifier = Arc::new(JwtVerifier::new(
        &settings.auth.jwt_secret,
        settings.auth.issuer.as_deref(),
    ));
    let collaborators = Collaborators::sqlite(&store, verifier, Arc::new(LogPushSender));
    let mut ctx = AppContext::new(ServerConfig::from(&settings), store, fanout, collaborators);
    if let Some(handle) = metrics {
        ctx = ctx.with_metrics(handle);
    }

    let server = ParleyServer::new(ctx);
    let addr = server.listen().await.context("Failed to bind server")?;
    info!(%addr, "parley gateway started");

    wait_for_signal().await?;
    info!("shutting down");
    server.shutdown(None).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["parley-gateway"]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 8090);
        assert_eq!(settings.fanout.backend, FanoutBackend::Memory);
    }

    #[test]
    fn cli_custom_port_and_host() {
        let cli = Cli::parse_from(["parley-gateway", "--port", "9000", "--host", "127.0.0.1"]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    #[test]
    fn cli_redis_url_selects_redis_backend() {
        let cli = Cli::parse_from(["parley-gateway", "--redis-url", "redis://cache:6379"]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.fanout.backend, FanoutBackend::Redis);
        assert_eq!(settings.fanout.redis_url, "redis://cache:6379");
    }

    #[test]
    fn cli_db_path_and_log_level() {
        let cli = Cli::parse_from([
            "parley-gateway",
            "--db-path",
            "/tmp/parley-test.db",
            "--log-level",
            "debug",
        ]);
        let mut settings = ParleySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.database.path, "/tmp/parley-test.db");
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::parse_from(["parley-gateway", "--config", "/etc/parley.json"]);
        assert_eq!(cli.settings_file(), PathBuf::from("/etc/parley.json"));
    }

    #[test]
    fn relative_db_path_resolves_under_home() {
        let resolved = resolve_db_path("parley.db");
        assert!(resolved.ends_with(".parley/parley.db"));
        assert_eq!(resolve_db_path("/var/lib/p.db"), PathBuf::from("/var/lib/p.db"));
    }

    #[test]
    fn ensure_parent_dir_creates_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("test.db");
        ensure_parent_dir(&path).unwrap();
        assert!(path.parent().unwrap().exists());
    }

    #[test]
    fn open_store_migrates_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ParleySettings::default();
        settings.database.path = dir.path().join("db").join("p.db").to_string_lossy().into_owned();
        let _store = open_store(&settings).unwrap();
        assert!(dir.path().join("db").join("p.db").exists());
    }

    #[tokio::test]
    async fn disabled_backend_builds_noop_adapter() {
        let mut settings = ParleySettings::default();
        settings.fanout.backend = FanoutBackend::Disabled;
        let adapter = build_fanout(&settings).await.unwrap();
        assert!(!adapter.is_enabled());
    }

    #[tokio::test]
    async fn memory_backend_builds_enabled_adapter() {
        let adapter = build_fanout(&ParleySettings::default()).await.unwrap();
        assert!(adapter.is_enabled());
        adapter.close().await;
    }
}
