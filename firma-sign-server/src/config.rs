//! Configuration system for the Firma-Sign server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute: `PORT`, `DB_PATH`,
//!    `STORAGE_PATH`, `JWT_SECRET`, `LOG_LEVEL`, `LOG_DIR`, `NODE_ENV`)
//! 3. TOML config file (`~/.config/firma-sign/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The JWT secret is missing or unusable outside development mode.
    #[error("invalid JWT secret configuration: {0}")]
    InvalidJwtSecret(String),
}

/// Minimum accepted JWT secret length in bytes.
const MIN_JWT_SECRET_LEN: usize = 16;

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    storage: StorageFileConfig,
    auth: AuthFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    port: Option<u16>,
    peer_id: Option<String>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    storage_path: Option<PathBuf>,
    db_path: Option<PathBuf>,
    max_file_size: Option<u64>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    jwt_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Firma-Sign document signing server")]
pub struct CliArgs {
    /// Port to listen on.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Path to config file (default: `~/.config/firma-sign/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Root directory for blob storage.
    #[arg(long, env = "STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Path to the SQLite database file.
    #[arg(long, env = "DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Secret for JWT (HS256) verification.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Directory for log files; stderr only when unset.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Deployment environment (`development` or `production`).
    #[arg(long, default_value = "development", env = "NODE_ENV")]
    pub env: String,

    /// Stable identity of this node.
    #[arg(long)]
    pub peer_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Root directory for blob storage.
    pub storage_path: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Secret for JWT verification.
    pub jwt_secret: String,
    /// Log level filter string.
    pub log_level: String,
    /// Directory for log files, when file logging is enabled.
    pub log_dir: Option<PathBuf>,
    /// Stable identity of this node.
    pub peer_id: String,
    /// Maximum accepted document size in bytes.
    pub max_file_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            storage_path: PathBuf::from("./storage"),
            db_path: PathBuf::from("./storage/firma-sign.db"),
            jwt_secret: String::new(),
            log_level: "info".to_string(),
            log_dir: None,
            peer_id: "self".to_string(),
            max_file_size: crate::blob::DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be
    /// read or parsed, or if the JWT secret is invalid for the chosen
    /// environment. A missing secret is fatal outside development; in
    /// development a fixed insecure secret is substituted so local runs
    /// work out of the box.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let mut config = Self::resolve(cli, &file);

        if config.jwt_secret.is_empty() {
            if cli.env == "production" {
                return Err(ConfigError::InvalidJwtSecret(
                    "JWT_SECRET must be set in production".to_string(),
                ));
            }
            tracing::warn!("JWT_SECRET not set; using insecure development secret");
            config.jwt_secret = "firma-sign-dev-secret".to_string();
        } else if config.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::InvalidJwtSecret(format!(
                "JWT secret must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        Ok(config)
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let storage_path = cli
            .storage_path
            .clone()
            .or_else(|| file.storage.storage_path.clone())
            .unwrap_or(defaults.storage_path);
        let db_path = cli
            .db_path
            .clone()
            .or_else(|| file.storage.db_path.clone())
            .unwrap_or_else(|| storage_path.join("firma-sign.db"));

        Self {
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            storage_path,
            db_path,
            jwt_secret: cli
                .jwt_secret
                .clone()
                .or_else(|| file.auth.jwt_secret.clone())
                .unwrap_or(defaults.jwt_secret),
            log_level: cli.log_level.clone(),
            log_dir: cli.log_dir.clone(),
            peer_id: cli
                .peer_id
                .clone()
                .or_else(|| file.server.peer_id.clone())
                .unwrap_or(defaults.peer_id),
            max_file_size: file
                .storage
                .max_file_size
                .unwrap_or(defaults.max_file_size),
        }
    }

    /// The blob-store root (`{storage_path}/docs`).
    #[must_use]
    pub fn blob_root(&self) -> PathBuf {
        self.storage_path.join("docs")
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("firma-sign").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
