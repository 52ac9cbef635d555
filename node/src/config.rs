use anyhow::{Context, Result};
use chrono::Duration;
use config::{Config, Environment, File as ConfigFile};
use piedpiper_auth::{PasswordPolicy, TokenPolicy};
use piedpiper_rpc::TlsFiles;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "PIEDPIPER";
pub const DEFAULT_CONFIG_PATH: &str = "config/piedpiper.toml";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// Node configuration: built-in defaults, then the optional TOML file, then
/// `PIEDPIPER_*` environment variables, then command-line flags.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    // Network
    pub host: String,
    pub port: u16,

    // TLS
    pub ssl: bool,
    pub fullchain: String,
    pub privatekey: String,

    // Storage
    pub db_path: String,
    pub data_path: String,
    pub max_upload_bytes: u64,

    // Passwords
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,

    // Tokens
    pub token_lifetime_hours: i64,
    pub request_skew_secs: i64,

    // Logging
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    pub fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            path.exists().then_some(path)
        };

        Self::from_sources(resolved_path, Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(path: Option<PathBuf>, env: Environment) -> Result<Self> {
        let defaults = PasswordPolicy::default();
        let mut builder = Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 5678)?
            .set_default("ssl", false)?
            .set_default("fullchain", "./fullchain.pem")?
            .set_default("privatekey", "./privkey.pem")?
            .set_default("db_path", "prod.db")?
            .set_default("data_path", "./data/")?
            .set_default("max_upload_bytes", DEFAULT_MAX_UPLOAD_BYTES)?
            .set_default("argon2_memory_kib", defaults.memory_kib)?
            .set_default("argon2_iterations", defaults.iterations)?
            .set_default("argon2_parallelism", defaults.parallelism)?
            .set_default("token_lifetime_hours", piedpiper_auth::TOKEN_LIFETIME_HOURS)?
            .set_default("request_skew_secs", piedpiper_auth::REQUEST_SKEW_SECS)?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?;

        if let Some(path) = &path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(env);

        let mut config: AppConfig = builder
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;
        config.config_path = path;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("HOST must not be empty");
        }
        if self.port == 0 {
            anyhow::bail!("PORT must be greater than zero");
        }
        if self.db_path.trim().is_empty() {
            anyhow::bail!("DB_PATH must not be empty");
        }
        if self.data_path.trim().is_empty() {
            anyhow::bail!("DATA_PATH must not be empty");
        }
        if self.max_upload_bytes == 0 || usize::try_from(self.max_upload_bytes).is_err() {
            anyhow::bail!("MAX_UPLOAD_BYTES must be a positive size");
        }
        if self.token_lifetime_hours <= 0 {
            anyhow::bail!("TOKEN_LIFETIME_HOURS must be greater than zero");
        }
        if self.request_skew_secs < 0 {
            anyhow::bail!("REQUEST_SKEW_SECS must not be negative");
        }
        if self.ssl {
            let files = [("FULLCHAIN", &self.fullchain), ("PRIVATEKEY", &self.privatekey)];
            for (key, path) in files {
                if !Path::new(path).is_file() {
                    anyhow::bail!("{} file {} not found (SSL is enabled)", key, path);
                }
            }
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("LOG_FORMAT must be 'pretty' or 'json'");
        }
        self.password_policy()
            .validate()
            .context("invalid argon2 settings")?;
        Ok(())
    }

    pub fn password_policy(&self) -> PasswordPolicy {
        PasswordPolicy {
            memory_kib: self.argon2_memory_kib,
            iterations: self.argon2_iterations,
            parallelism: self.argon2_parallelism,
        }
    }

    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            lifetime: Duration::hours(self.token_lifetime_hours),
            request_skew: Duration::seconds(self.request_skew_secs),
        }
    }

    /// Certificate and key paths when HTTPS is enabled.
    pub fn tls_files(&self) -> Option<TlsFiles> {
        self.ssl.then(|| TlsFiles {
            fullchain: PathBuf::from(&self.fullchain),
            privatekey: PathBuf::from(&self.privatekey),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(&self.data_path)
    }
}

pub fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }

    if matches.get_flag("ssl") {
        config.ssl = true;
    }

    if let Some(fullchain) = matches.get_one::<String>("fullchain") {
        config.fullchain = fullchain.clone();
    }

    if let Some(privatekey) = matches.get_one::<String>("privatekey") {
        config.privatekey = privatekey.clone();
    }

    if let Some(db_path) = matches.get_one::<String>("dbfile") {
        config.db_path = db_path.clone();
    }

    if let Some(data_path) = matches.get_one::<String>("datapath") {
        config.data_path = data_path.clone();
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }
}
