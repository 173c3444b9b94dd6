use serde::{Deserialize, Serialize};

/// Top-level gateway configuration. Environment variables (spec §6) are the
/// primary surface; this TOML-backed struct exists for the optional
/// on-disk override file and is otherwise populated from env/CLI defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding persisted recording JSON files.
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: String,
    /// Directory holding uploaded APK/XAPK/ZIP files.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbConfig {
    /// Host the ADB server listens on.
    #[serde(default = "default_adb_host")]
    pub host: String,
    /// Port the ADB server listens on.
    #[serde(default = "default_adb_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `silent`, `error`, `warn`, `info`, `debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log full frame payloads on the device socket, not just size/kind.
    #[serde(default)]
    pub log_payload: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            recordings_dir: default_recordings_dir(),
            uploads_dir: default_uploads_dir(),
        }
    }
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            host: default_adb_host(),
            port: default_adb_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_payload: false,
        }
    }
}

impl GatewayConfig {
    /// Build a config from the environment variables named in spec §6,
    /// falling back to defaults for anything unset. This is the primary
    /// configuration path; `load_from_path` is only used when an operator
    /// points the CLI at an override file.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host_port) = std::env::var("ADB_HOST") {
            config.adb.host = host_port;
        }
        if let Ok(port) = std::env::var("ADB_PORT") {
            if let Ok(parsed) = port.parse() {
                config.adb.port = parsed;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if std::env::var("DEVICE_SOCKET_LOG_PAYLOAD").is_ok() {
            config.logging.log_payload = true;
        }

        config
    }

    /// Load an optional TOML override file, falling back to env/defaults
    /// for anything the file doesn't set.
    pub fn load_from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: GatewayConfig = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.adb.port == 0 {
            issues.push("ERROR: adb.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.server.recordings_dir.trim().is_empty() {
            issues.push("ERROR: server.recordings_dir must not be empty.".to_string());
        }
        if self.server.uploads_dir.trim().is_empty() {
            issues.push("ERROR: server.uploads_dir must not be empty.".to_string());
        }
        if self.server.recordings_dir == self.server.uploads_dir {
            issues.push(
                "WARNING: recordings_dir and uploads_dir are the same path; recordings and \
                 uploaded APKs will share a directory."
                    .to_string(),
            );
        }

        match self.logging.level.as_str() {
            "silent" | "error" | "warn" | "info" | "debug" => {}
            other => {
                issues.push(format!(
                    "ERROR: logging.level must be one of silent/error/warn/info/debug, got '{}'.",
                    other
                ));
            }
        }

        if issues.iter().any(|i| i.starts_with("ERROR:")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_recordings_dir() -> String {
    "recordings".to_string()
}
fn default_uploads_dir() -> String {
    "uploads".to_string()
}
fn default_adb_host() -> String {
    "127.0.0.1".to_string()
}
fn default_adb_port() -> u16 {
    5037
}
fn default_log_level() -> String {
    "info".to_string()
}
