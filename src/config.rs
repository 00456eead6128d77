use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs as _},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

pub const PROJECT_CONFIG_FILE_NAME: &str = "tapproxy.toml";
pub const LEGACY_CONFIG_PATH: &str = "config/config.toml";
pub const DEFAULT_COMMON_NAME: &str = "tapproxy Local CA";

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_CONNECTIONS: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub repeater: RepeaterConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    /// Loads configuration from `path`, or from the first discovered default
    /// location relative to the working directory.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        let Some(discovered) = discover_config_path(Path::new(".")) else {
            bail!(
                "no config file found; pass `--config` or create `{PROJECT_CONFIG_FILE_NAME}` or `{LEGACY_CONFIG_PATH}`"
            );
        };
        Self::from_path(&discovered)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

pub fn discover_config_path(base_dir: &Path) -> Option<PathBuf> {
    [PROJECT_CONFIG_FILE_NAME, LEGACY_CONFIG_PATH]
        .into_iter()
        .map(|candidate| base_dir.join(candidate))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout: u64,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    #[serde(default = "default_common_name")]
    pub common_name: String,
    #[serde(default)]
    pub upstream_root_certs: Vec<PathBuf>,
}

impl ProxyConfig {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        resolve_listen_addr(&self.host, self.port)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_secs(self.read_timeout, self.write_timeout)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RepeaterConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout: u64,
}

impl RepeaterConfig {
    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        resolve_listen_addr(&self.host, self.port)
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_secs(self.read_timeout, self.write_timeout)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Per-socket deadlines derived from the `read_timeout`/`write_timeout` options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
}

impl Timeouts {
    pub fn from_secs(read: u64, write: u64) -> Self {
        Self {
            read: Duration::from_secs(read.max(1)),
            write: Duration::from_secs(write.max(1)),
        }
    }
}

fn resolve_listen_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve listen address {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow::anyhow!("listen address {host}:{port} resolved to nothing"))
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_common_name() -> String {
    DEFAULT_COMMON_NAME.to_owned()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use super::{Config, LEGACY_CONFIG_PATH, LogFormat, discover_config_path};
    use tempfile::tempdir;

    const FULL_CONFIG: &str = r#"
[proxy]
host = "127.0.0.1"
port = 8080
read_timeout = 5
write_timeout = 7
ca_cert = "/tmp/ca/cert.pem"
ca_key = "/tmp/ca/key.pem"
common_name = "Test CA"

[repeater]
host = "127.0.0.1"
port = 8081

[db]
path = "/tmp/tapproxy/records.db"
max_connections = 4

[logging]
level = "debug"
format = "pretty"
"#;

    #[test]
    fn full_config_parses_all_sections() {
        let config = Config::from_toml_str(FULL_CONFIG).expect("config should parse");

        assert_eq!(config.proxy.addr().unwrap(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.proxy.timeouts().read, Duration::from_secs(5));
        assert_eq!(config.proxy.timeouts().write, Duration::from_secs(7));
        assert_eq!(config.proxy.common_name, "Test CA");
        assert!(config.proxy.upstream_root_certs.is_empty());
        assert_eq!(config.repeater.addr().unwrap(), "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.repeater.timeouts().read, Duration::from_secs(10));
        assert_eq!(config.db.max_connections, 4);
        let logging = config.logging.expect("logging section should parse");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn defaults_apply_to_optional_fields() {
        let config = Config::from_toml_str(
            r#"
[proxy]
host = "127.0.0.1"
port = 0
ca_cert = "cert.pem"
ca_key = "key.pem"

[repeater]
host = "127.0.0.1"
port = 0

[db]
path = "records.db"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.proxy.common_name, super::DEFAULT_COMMON_NAME);
        assert_eq!(config.proxy.read_timeout, 10);
        assert_eq!(config.db.max_connections, 10);
        assert!(config.logging.is_none());
    }

    #[test]
    fn missing_db_section_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[proxy]
host = "127.0.0.1"
port = 0
ca_cert = "cert.pem"
ca_key = "key.pem"

[repeater]
host = "127.0.0.1"
port = 0
"#,
        )
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("db"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml = FULL_CONFIG.replace("common_name = \"Test CA\"", "mystery = 1");
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn discovery_prefers_project_file_over_legacy_location() {
        let dir = tempdir().expect("tempdir should be created");
        assert_eq!(discover_config_path(dir.path()), None);

        let legacy = dir.path().join(LEGACY_CONFIG_PATH);
        fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        fs::write(&legacy, FULL_CONFIG).unwrap();
        assert_eq!(discover_config_path(dir.path()), Some(legacy));

        let project = dir.path().join("tapproxy.toml");
        fs::write(&project, FULL_CONFIG).unwrap();
        assert_eq!(discover_config_path(dir.path()), Some(project));
    }

    #[test]
    fn from_path_reports_missing_file() {
        let err = Config::from_path(Path::new("/nonexistent/tapproxy.toml")).unwrap_err();
        assert!(err.to_string().contains("read config"), "error: {err}");
    }
}
