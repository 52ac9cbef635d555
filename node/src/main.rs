use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Arg, ArgAction, Command};
use fs2::FileExt;
use piedpiper_files::LocalBlobStore;
use piedpiper_rpc::{start_server, AppState, Services};
use piedpiper_storage::{KvStore, SledStore};
use piedpiper_types::{SystemClock, Timestamp};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use crate::config::{load_config_with_overrides, AppConfig};

const LOCK_FILE_NAME: &str = ".piedpiper.lock";

fn cli() -> Command {
    Command::new("piedpiper-node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("PiedPiper file hosting server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Port to listen on"),
        )
        .arg(
            Arg::new("ssl")
                .long("ssl")
                .action(ArgAction::SetTrue)
                .help("Serve HTTPS using the certificate and key files"),
        )
        .arg(
            Arg::new("fullchain")
                .long("fullchain")
                .value_name("FILE")
                .help("PEM certificate chain (SSL mode only)"),
        )
        .arg(
            Arg::new("privatekey")
                .long("privatekey")
                .value_name("FILE")
                .help("PEM private key (SSL mode only)"),
        )
        .arg(
            Arg::new("dbfile")
                .long("dbfile")
                .value_name("FILE")
                .help("Path of the database file"),
        )
        .arg(
            Arg::new("datapath")
                .long("datapath")
                .value_name("DIR")
                .help("Directory that holds uploaded blobs"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Log output format"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration and exit"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    if matches.get_flag("check") {
        println!("Configuration OK");
        println!("  listen:   {}", config.listen_addr());
        println!("  tls:      {}", if config.ssl { "on" } else { "off" });
        println!("  database: {}", config.db_path);
        println!("  data:     {}", config.data_path);
        return Ok(());
    }

    init_logging(&config)?;
    run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
    info!("Starting PiedPiper node v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config.config_path {
        info!("Config file: {}", path.display());
    } else {
        info!("Config file: (built-in defaults)");
    }
    info!("Data directory: {}", config.data_path);

    fs::create_dir_all(config.data_dir())
        .with_context(|| format!("failed to create data directory {}", config.data_path))?;
    let _data_dir_lock = DataDirLock::acquire(config.data_dir())?;

    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(
        SledStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path))?,
    );
    info!("Storage initialized at {}", config.db_path);

    let blobs = Arc::new(LocalBlobStore::new(config.data_dir())?);
    let store_handle: Arc<dyn KvStore> = store.clone();
    let services = Services::new(
        store_handle,
        blobs,
        Arc::new(SystemClock),
        config.password_policy(),
        config.token_policy(),
    );

    let report = services
        .catalog
        .reconcile_owner_index()
        .context("owner index reconciliation failed")?;
    if report.users_updated > 0 || report.orphaned_objects > 0 {
        warn!(
            "Reconciliation repaired {} owner indexes; {} orphaned objects",
            report.users_updated, report.orphaned_objects
        );
    }

    let max_upload_bytes = usize::try_from(config.max_upload_bytes)
        .context("max_upload_bytes does not fit in memory")?;
    let state = AppState::new(services, max_upload_bytes);
    let addr = config.listen_addr();
    let tls = config.tls_files();
    let scheme = if tls.is_some() { "https" } else { "http" };
    info!("HTTP API available at: {}://{}", scheme, addr);

    start_server(state, &addr, tls, shutdown_signal()).await?;

    info!("Shutting down PiedPiper node");
    store.flush().context("failed to flush storage")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()?;
    }

    Ok(())
}

/// Exclusive lock on the data directory so two nodes never share one store.
struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    fn acquire<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running node or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};started={}",
            std::process::id(),
            Timestamp::from_datetime(Utc::now())
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}
