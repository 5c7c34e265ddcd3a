use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub tracker_store: TrackerStoreConfig,
    pub lock: LockConfig,
    pub engine: EngineConfig,
    pub session: SessionSettings,
    pub training: TrainingConfig,
    pub model: ModelConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct TrackerStoreConfig {
    pub backend: StoreBackend,
    /// Upper bound for a single store call; elapsed calls count as unavailable.
    pub timeout_ms: u64,
    pub sql: SqlStoreConfig,
    pub cache: CacheStoreConfig,
}

#[derive(Clone, Debug)]
pub struct SqlStoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CacheStoreConfig {
    pub key_prefix: String,
    /// Record expiry; `0` keeps records until evicted by capacity.
    pub ttl_secs: u64,
    pub max_capacity: u64,
}

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub acquire_timeout_ms: u64,
}

/// Where dialogue responses come from. Without a `url` messages are only
/// recorded and replies are appended later through the tracker events API.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// `0` disables session expiration.
    pub expiration_minutes: u64,
    pub carry_over_slots: bool,
}

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub command: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    pub liveness_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub initial_reference: Option<String>,
    pub remote_timeout_secs: u64,
    pub remote_auth_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Cache,
    Sql,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub store_backend: Option<StoreBackend>,
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub model_reference: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("`{path}` is not valid TOML: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file `{0}` does not exist")]
    MissingConfigFile(PathBuf),
    #[error("`${{{var}}}` is referenced but not set")]
    MissingEnvInterpolation { var: String },
    #[error("`${{` without a closing `}}`")]
    UnterminatedInterpolation,
    #[error("`{key}={value}` is not a valid value")]
    InvalidEnvOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tracker_store: TrackerStoreConfig {
                backend: StoreBackend::Memory,
                timeout_ms: 5_000,
                sql: SqlStoreConfig {
                    url: "sqlite://colloquy.db".to_string(),
                    max_connections: 5,
                    timeout_secs: 30,
                },
                cache: CacheStoreConfig {
                    key_prefix: "tracker:".to_string(),
                    ttl_secs: 0,
                    max_capacity: 100_000,
                },
            },
            lock: LockConfig { acquire_timeout_ms: 10_000 },
            engine: EngineConfig { url: None, timeout_secs: 30 },
            session: SessionSettings { expiration_minutes: 60, carry_over_slots: true },
            training: TrainingConfig {
                command: "colloquy-train".to_string(),
                args: Vec::new(),
                output_dir: PathBuf::from("models"),
                liveness_timeout_secs: 300,
                heartbeat_interval_secs: 10,
            },
            model: ModelConfig {
                initial_reference: None,
                remote_timeout_secs: 60,
                remote_auth_token: None,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 5005,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Self::Memory),
            "cache" | "keyed_cache" => Ok(Self::Cache),
            "sql" | "sqlite" => Ok(Self::Sql),
            other => Err(ConfigError::Validation(format!(
                "unsupported tracker store backend `{other}` (expected memory|cache|sql)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl TrackerStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheStoreConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            carry_over_slots: self.carry_over_slots,
            ..SessionConfig::with_expiration_minutes(self.expiration_minutes)
        }
    }
}

impl TrainingConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("colloquy.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(store) = patch.tracker_store {
            if let Some(backend) = store.backend {
                self.tracker_store.backend = backend;
            }
            if let Some(timeout_ms) = store.timeout_ms {
                self.tracker_store.timeout_ms = timeout_ms;
            }
            if let Some(sql) = store.sql {
                if let Some(url) = sql.url {
                    self.tracker_store.sql.url = url;
                }
                if let Some(max_connections) = sql.max_connections {
                    self.tracker_store.sql.max_connections = max_connections;
                }
                if let Some(timeout_secs) = sql.timeout_secs {
                    self.tracker_store.sql.timeout_secs = timeout_secs;
                }
            }
            if let Some(cache) = store.cache {
                if let Some(key_prefix) = cache.key_prefix {
                    self.tracker_store.cache.key_prefix = key_prefix;
                }
                if let Some(ttl_secs) = cache.ttl_secs {
                    self.tracker_store.cache.ttl_secs = ttl_secs;
                }
                if let Some(max_capacity) = cache.max_capacity {
                    self.tracker_store.cache.max_capacity = max_capacity;
                }
            }
        }

        if let Some(lock) = patch.lock {
            if let Some(acquire_timeout_ms) = lock.acquire_timeout_ms {
                self.lock.acquire_timeout_ms = acquire_timeout_ms;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(url) = engine.url {
                self.engine.url = Some(url);
            }
            if let Some(timeout_secs) = engine.timeout_secs {
                self.engine.timeout_secs = timeout_secs;
            }
        }

        if let Some(session) = patch.session {
            if let Some(expiration_minutes) = session.expiration_minutes {
                self.session.expiration_minutes = expiration_minutes;
            }
            if let Some(carry_over_slots) = session.carry_over_slots {
                self.session.carry_over_slots = carry_over_slots;
            }
        }

        if let Some(training) = patch.training {
            if let Some(command) = training.command {
                self.training.command = command;
            }
            if let Some(args) = training.args {
                self.training.args = args;
            }
            if let Some(output_dir) = training.output_dir {
                self.training.output_dir = output_dir;
            }
            if let Some(liveness_timeout_secs) = training.liveness_timeout_secs {
                self.training.liveness_timeout_secs = liveness_timeout_secs;
            }
            if let Some(heartbeat_interval_secs) = training.heartbeat_interval_secs {
                self.training.heartbeat_interval_secs = heartbeat_interval_secs;
            }
        }

        if let Some(model) = patch.model {
            if let Some(initial_reference) = model.initial_reference {
                self.model.initial_reference = Some(initial_reference);
            }
            if let Some(remote_timeout_secs) = model.remote_timeout_secs {
                self.model.remote_timeout_secs = remote_timeout_secs;
            }
            if let Some(remote_auth_token_value) = model.remote_auth_token {
                self.model.remote_auth_token = Some(secret_value(remote_auth_token_value));
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_BACKEND") {
            self.tracker_store.backend = value.parse()?;
        }
        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_TIMEOUT_MS") {
            self.tracker_store.timeout_ms = parse_u64("COLLOQUY_TRACKER_STORE_TIMEOUT_MS", &value)?;
        }

        let database_url =
            read_env("COLLOQUY_TRACKER_STORE_SQL_URL").or_else(|| read_env("COLLOQUY_DATABASE_URL"));
        if let Some(value) = database_url {
            self.tracker_store.sql.url = value;
        }
        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_SQL_MAX_CONNECTIONS") {
            self.tracker_store.sql.max_connections =
                parse_u32("COLLOQUY_TRACKER_STORE_SQL_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_SQL_TIMEOUT_SECS") {
            self.tracker_store.sql.timeout_secs =
                parse_u64("COLLOQUY_TRACKER_STORE_SQL_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_CACHE_KEY_PREFIX") {
            self.tracker_store.cache.key_prefix = value;
        }
        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_CACHE_TTL_SECS") {
            self.tracker_store.cache.ttl_secs =
                parse_u64("COLLOQUY_TRACKER_STORE_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("COLLOQUY_TRACKER_STORE_CACHE_MAX_CAPACITY") {
            self.tracker_store.cache.max_capacity =
                parse_u64("COLLOQUY_TRACKER_STORE_CACHE_MAX_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("COLLOQUY_LOCK_ACQUIRE_TIMEOUT_MS") {
            self.lock.acquire_timeout_ms = parse_u64("COLLOQUY_LOCK_ACQUIRE_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("COLLOQUY_ENGINE_URL") {
            self.engine.url = Some(value);
        }
        if let Some(value) = read_env("COLLOQUY_ENGINE_TIMEOUT_SECS") {
            self.engine.timeout_secs = parse_u64("COLLOQUY_ENGINE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("COLLOQUY_SESSION_EXPIRATION_MINUTES") {
            self.session.expiration_minutes =
                parse_u64("COLLOQUY_SESSION_EXPIRATION_MINUTES", &value)?;
        }
        if let Some(value) = read_env("COLLOQUY_SESSION_CARRY_OVER_SLOTS") {
            self.session.carry_over_slots = parse_bool("COLLOQUY_SESSION_CARRY_OVER_SLOTS", &value)?;
        }

        if let Some(value) = read_env("COLLOQUY_TRAINING_COMMAND") {
            self.training.command = value;
        }
        if let Some(value) = read_env("COLLOQUY_TRAINING_OUTPUT_DIR") {
            self.training.output_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("COLLOQUY_TRAINING_LIVENESS_TIMEOUT_SECS") {
            self.training.liveness_timeout_secs =
                parse_u64("COLLOQUY_TRAINING_LIVENESS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("COLLOQUY_TRAINING_HEARTBEAT_INTERVAL_SECS") {
            self.training.heartbeat_interval_secs =
                parse_u64("COLLOQUY_TRAINING_HEARTBEAT_INTERVAL_SECS", &value)?;
        }

        if let Some(value) = read_env("COLLOQUY_MODEL_INITIAL_REFERENCE") {
            self.model.initial_reference = Some(value);
        }
        if let Some(value) = read_env("COLLOQUY_MODEL_REMOTE_TIMEOUT_SECS") {
            self.model.remote_timeout_secs =
                parse_u64("COLLOQUY_MODEL_REMOTE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("COLLOQUY_MODEL_REMOTE_AUTH_TOKEN") {
            self.model.remote_auth_token = Some(secret_value(value));
        }

        if let Some(value) = read_env("COLLOQUY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("COLLOQUY_SERVER_PORT") {
            self.server.port = parse_u16("COLLOQUY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("COLLOQUY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("COLLOQUY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("COLLOQUY_LOGGING_LEVEL").or_else(|| read_env("COLLOQUY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("COLLOQUY_LOGGING_FORMAT").or_else(|| read_env("COLLOQUY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(backend) = overrides.store_backend {
            self.tracker_store.backend = backend;
        }
        if let Some(database_url) = overrides.database_url {
            self.tracker_store.sql.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(model_reference) = overrides.model_reference {
            self.model.initial_reference = Some(model_reference);
        }
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_tracker_store(&self.tracker_store)?;
        validate_lock(&self.lock)?;
        validate_engine(&self.engine)?;
        validate_training(&self.training)?;
        validate_model(&self.model)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("colloquy.toml"), PathBuf::from("config/colloquy.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_tracker_store(store: &TrackerStoreConfig) -> Result<(), ConfigError> {
    if store.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "tracker_store.timeout_ms must be greater than zero".to_string(),
        ));
    }

    if store.backend == StoreBackend::Sql {
        let url = store.sql.url.trim();
        let sqlite_url =
            url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
        if !sqlite_url {
            return Err(ConfigError::Validation(
                "tracker_store.sql.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                    .to_string(),
            ));
        }

        if store.sql.max_connections == 0 {
            return Err(ConfigError::Validation(
                "tracker_store.sql.max_connections must be greater than zero".to_string(),
            ));
        }

        if store.sql.timeout_secs == 0 || store.sql.timeout_secs > 300 {
            return Err(ConfigError::Validation(
                "tracker_store.sql.timeout_secs must be in range 1..=300".to_string(),
            ));
        }
    }

    if store.backend == StoreBackend::Cache {
        if store.cache.key_prefix.trim().is_empty() {
            return Err(ConfigError::Validation(
                "tracker_store.cache.key_prefix must not be empty".to_string(),
            ));
        }
        if store.cache.max_capacity == 0 {
            return Err(ConfigError::Validation(
                "tracker_store.cache.max_capacity must be greater than zero".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_lock(lock: &LockConfig) -> Result<(), ConfigError> {
    if lock.acquire_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "lock.acquire_timeout_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if let Some(url) = &engine.url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Validation(
                "engine.url must start with http:// or https://".to_string(),
            ));
        }
    }

    if engine.timeout_secs == 0 || engine.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "engine.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_training(training: &TrainingConfig) -> Result<(), ConfigError> {
    if training.command.trim().is_empty() {
        return Err(ConfigError::Validation("training.command must not be empty".to_string()));
    }

    if training.heartbeat_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "training.heartbeat_interval_secs must be greater than zero".to_string(),
        ));
    }

    if training.liveness_timeout_secs <= training.heartbeat_interval_secs {
        return Err(ConfigError::Validation(
            "training.liveness_timeout_secs must exceed training.heartbeat_interval_secs"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_model(model: &ModelConfig) -> Result<(), ConfigError> {
    if model.remote_timeout_secs == 0 || model.remote_timeout_secs > 3_600 {
        return Err(ConfigError::Validation(
            "model.remote_timeout_secs must be in range 1..=3600".to_string(),
        ));
    }

    if let Some(reference) = &model.initial_reference {
        if reference.trim().is_empty() {
            return Err(ConfigError::Validation(
                "model.initial_reference must not be blank when set".to_string(),
            ));
        }
    }

    let blank_token =
        model.remote_auth_token.as_ref().is_some_and(|token| token.expose_secret().trim().is_empty());
    if blank_token {
        return Err(ConfigError::Validation(
            "model.remote_auth_token must not be blank when set".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    tracker_store: Option<TrackerStorePatch>,
    lock: Option<LockPatch>,
    engine: Option<EnginePatch>,
    session: Option<SessionPatch>,
    training: Option<TrainingPatch>,
    model: Option<ModelPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackerStorePatch {
    backend: Option<StoreBackend>,
    timeout_ms: Option<u64>,
    sql: Option<SqlStorePatch>,
    cache: Option<CacheStorePatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SqlStorePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheStorePatch {
    key_prefix: Option<String>,
    ttl_secs: Option<u64>,
    max_capacity: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LockPatch {
    acquire_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    expiration_minutes: Option<u64>,
    carry_over_slots: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct TrainingPatch {
    command: Option<String>,
    args: Option<Vec<String>>,
    output_dir: Option<PathBuf>,
    liveness_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelPatch {
    initial_reference: Option<String>,
    remote_timeout_secs: Option<u64>,
    remote_auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use chrono::Duration;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, StoreBackend};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_and_use_memory_store() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| format!("defaults must validate: {err}"))?;

        ensure(config.tracker_store.backend == StoreBackend::Memory, "memory is the default")?;
        ensure(config.session.carry_over_slots, "slots carry over by default")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )?;
        ensure(
            config.session.to_session_config().session_expiration == Some(Duration::minutes(60)),
            "default session expiration should be one hour",
        )
    }

    #[test]
    fn config_file_values_expand_environment_variables() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_COLLOQUY_DB_PATH", "/var/lib/colloquy/trackers.db");
        env::set_var("TEST_COLLOQUY_MODEL_TOKEN", "token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("colloquy.toml");
            fs::write(
                &path,
                r#"
[tracker_store]
backend = "sql"

[tracker_store.sql]
url = "sqlite://${TEST_COLLOQUY_DB_PATH}"

[model]
remote_auth_token = "${TEST_COLLOQUY_MODEL_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.tracker_store.backend == StoreBackend::Sql, "backend read from file")?;
            ensure(
                config.tracker_store.sql.url == "sqlite:///var/lib/colloquy/trackers.db",
                "sql url should be interpolated from environment",
            )?;
            ensure(
                config
                    .model
                    .remote_auth_token
                    .as_ref()
                    .is_some_and(|token| token.expose_secret() == "token-from-env"),
                "auth token should be interpolated from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_COLLOQUY_DB_PATH", "TEST_COLLOQUY_MODEL_TOKEN"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_an_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["TEST_COLLOQUY_UNSET_VAR"]);

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("colloquy.toml");
        fs::write(&path, "[server]\nbind_address = \"${TEST_COLLOQUY_UNSET_VAR}\"\n")
            .map_err(|err| err.to_string())?;

        match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Err(ConfigError::MissingEnvInterpolation { var }) => {
                ensure(var == "TEST_COLLOQUY_UNSET_VAR", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected interpolation failure".to_string()),
        }
    }

    #[test]
    fn logging_section_reads_colloquy_env_vars() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("COLLOQUY_LOG_LEVEL", "warn");
        env::set_var("COLLOQUY_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["COLLOQUY_LOG_LEVEL", "COLLOQUY_LOG_FORMAT"]);
        result
    }

    #[test]
    fn overrides_beat_env_which_beats_file_which_beats_defaults() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("COLLOQUY_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("COLLOQUY_LOCK_ACQUIRE_TIMEOUT_MS", "750");
        env::set_var("COLLOQUY_SESSION_CARRY_OVER_SLOTS", "false");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("colloquy.toml");
            fs::write(
                &path,
                r#"
[tracker_store]
backend = "cache"

[tracker_store.sql]
url = "sqlite://from-file.db"

[lock]
acquire_timeout_ms = 2000

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    store_backend: Some(StoreBackend::Sql),
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.tracker_store.backend == StoreBackend::Sql, "override backend wins")?;
            ensure(
                config.tracker_store.sql.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.lock.acquire_timeout_ms == 750, "env lock timeout beats the file")?;
            ensure(!config.session.carry_over_slots, "env disables slot carry-over")?;
            Ok(())
        })();

        clear_vars(&[
            "COLLOQUY_DATABASE_URL",
            "COLLOQUY_LOCK_ACQUIRE_TIMEOUT_MS",
            "COLLOQUY_SESSION_CARRY_OVER_SLOTS",
        ]);
        result
    }

    #[test]
    fn invalid_env_override_names_the_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        env::set_var("COLLOQUY_SERVER_PORT", "not-a-port");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "COLLOQUY_SERVER_PORT", "error should name the variable")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected invalid override failure".to_string()),
        };

        clear_vars(&["COLLOQUY_SERVER_PORT"]);
        result
    }

    #[test]
    fn invalid_values_are_rejected_before_startup() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("COLLOQUY_TRAINING_HEARTBEAT_INTERVAL_SECS", "30");
        env::set_var("COLLOQUY_TRAINING_LIVENESS_TIMEOUT_SECS", "20");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("training.liveness_timeout_secs")
            );
            ensure(has_message, "validation failure should mention the liveness timeout")
        })();

        clear_vars(&[
            "COLLOQUY_TRAINING_HEARTBEAT_INTERVAL_SECS",
            "COLLOQUY_TRAINING_LIVENESS_TIMEOUT_SECS",
        ]);
        result
    }

    #[test]
    fn engine_section_configures_the_dialogue_endpoint() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["COLLOQUY_ENGINE_URL", "COLLOQUY_ENGINE_TIMEOUT_SECS"]);
        env::set_var("COLLOQUY_ENGINE_TIMEOUT_SECS", "5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("colloquy.toml");
            fs::write(
                &path,
                r#"
[engine]
url = "http://127.0.0.1:5055/respond"
timeout_secs = 9
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path.clone()),
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                config.engine.url.as_deref() == Some("http://127.0.0.1:5055/respond"),
                "engine url comes from the file",
            )?;
            ensure(config.engine.timeout_secs == 5, "env timeout beats the file")?;

            fs::write(&path, "[engine]\nurl = \"ftp://engine\"\n")
                .map_err(|err| err.to_string())?;
            let rejected = AppConfig::load(LoadOptions {
                config_path: Some(path),
                ..LoadOptions::default()
            });
            ensure(
                matches!(rejected, Err(ConfigError::Validation(_))),
                "non-http engine url is rejected",
            )
        })();

        clear_vars(&["COLLOQUY_ENGINE_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn debug_output_redacts_the_remote_auth_token() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("COLLOQUY_MODEL_REMOTE_AUTH_TOKEN", "model-store-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("model-store-secret-value"),
                "debug output should not contain the auth token",
            )
        })();

        clear_vars(&["COLLOQUY_MODEL_REMOTE_AUTH_TOKEN"]);
        result
    }
}
