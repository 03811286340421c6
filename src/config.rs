use crate::error::Error;
use crate::server::connection_pool::PoolConfig;
use crate::target::{Target, DEFAULT_IPMI_PORT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(Error::Config(format!(
                "Invalid log level '{}'. Valid levels are: error, warn, info, debug, trace",
                s
            ))),
        }
    }
}

fn default_listen() -> ListenConfig {
    ListenConfig::String("0.0.0.0:8080".to_string())
}

fn default_ipmi_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_rmcp_plus() -> bool {
    true
}

/// Credentials shared by every BMC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpmiConfig {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
    // Per-request RMCP timeout.
    #[serde(default = "default_ipmi_timeout")]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_rmcp_plus")]
    pub rmcp_plus: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: ListenConfig,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub cors_allow_all: bool,
    pub ipmi: IpmiConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub host: BTreeMap<String, HostConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenConfig {
    SocketAddr(SocketAddr),
    String(String),
}

impl std::fmt::Display for ListenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenConfig::SocketAddr(addr) => write!(f, "{}", addr),
            ListenConfig::String(s) => write!(f, "{}", s),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and resolve the IPMI password.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;
        config.resolve_password()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default() -> Self {
        let mut host = BTreeMap::new();
        host.insert(
            "node1".to_string(),
            HostConfig {
                address: "192.0.2.10".to_string(),
                port: None,
            },
        );
        Config {
            listen: default_listen(),
            log_level: LogLevel::default(),
            cors_allow_all: false,
            ipmi: IpmiConfig {
                username: "ADMIN".to_string(),
                password: None,
                password_file: Some(PathBuf::from("ipmi-password")),
                timeout: default_ipmi_timeout(),
                rmcp_plus: default_rmcp_plus(),
            },
            pool: PoolConfig::default(),
            host,
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize TOML: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Read `password_file` into `password`. Exactly one of the two must be set.
    pub fn resolve_password(&mut self) -> Result<(), Error> {
        match (&self.ipmi.password, &self.ipmi.password_file) {
            (Some(_), None) => Ok(()),
            (None, Some(path)) => {
                let password = fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!(
                        "Failed to read password file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                self.ipmi.password = Some(password.trim_end_matches(['\r', '\n']).to_string());
                self.ipmi.password_file = None;
                Ok(())
            }
            (None, None) => Err(Error::Config(
                "Either `ipmi.password` or `ipmi.password_file` must be provided".to_string(),
            )),
            (Some(_), Some(_)) => Err(Error::Config(
                "Cannot set both `ipmi.password` and `ipmi.password_file`".to_string(),
            )),
        }
    }

    /// Parse the listen configuration into a SocketAddr
    pub fn parse_listen_addr(&self) -> Result<SocketAddr, Error> {
        match &self.listen {
            ListenConfig::SocketAddr(addr) => Ok(*addr),
            ListenConfig::String(s) => {
                // "*:8080" and a bare "8080" both mean every interface.
                let addr_str = if s.starts_with('*') {
                    s.replacen('*', "0.0.0.0", 1)
                } else if !s.contains(':') {
                    format!("0.0.0.0:{}", s)
                } else {
                    s.clone()
                };

                if let Ok(addr) = addr_str.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                use std::net::ToSocketAddrs;
                addr_str
                    .to_socket_addrs()
                    .map_err(|e| Error::Config(format!("Invalid listen address '{}': {}", s, e)))?
                    .next()
                    .ok_or_else(|| Error::Config(format!("No address resolved for '{}'", s)))
            }
        }
    }

    /// Targets built from the host table, requires a resolved password.
    pub fn targets(&self) -> Result<Vec<Target>, Error> {
        let password = self
            .ipmi
            .password
            .as_ref()
            .ok_or_else(|| Error::Config("IPMI password is not resolved".to_string()))?;
        Ok(self
            .host
            .iter()
            .map(|(name, host)| {
                Target::new(
                    name.clone(),
                    host.address.clone(),
                    self.ipmi.username.clone(),
                    password.clone(),
                )
                .with_port(host.port.unwrap_or(DEFAULT_IPMI_PORT))
            })
            .collect())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        self.parse_listen_addr()?;

        if self.ipmi.username.is_empty() {
            return Err(Error::Config("ipmi.username is empty".to_string()));
        }
        if self.ipmi.password.is_none() {
            return Err(Error::Config("IPMI password is not resolved".to_string()));
        }
        if self.ipmi.timeout.is_zero() {
            return Err(Error::Config("ipmi.timeout must be greater than 0".to_string()));
        }

        if self.pool.capacity == 0 {
            return Err(Error::Config(
                "pool.capacity must be greater than 0".to_string(),
            ));
        }
        if self.pool.acquire_timeout.is_zero() || self.pool.sweep_interval.is_zero() {
            return Err(Error::Config(
                "pool.acquire_timeout and pool.sweep_interval must be greater than 0".to_string(),
            ));
        }

        for (name, host) in &self.host {
            if host.address.is_empty() {
                return Err(Error::Config(format!("host.{}.address is empty", name)));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "listen: {}\r
            log_level: {}\r
            cors_allow_all: {}\r
            ipmi.username: {}\r
            ipmi.password: {}\r
            ipmi.timeout: {}\r
            ipmi.rmcp_plus: {}\r
            pool: {}\r
            hosts: {}\r",
            self.listen,
            self.log_level,
            self.cors_allow_all,
            self.ipmi.username,
            self.ipmi.password.as_ref().map_or("None", |_| "***"),
            humantime::format_duration(self.ipmi.timeout),
            self.ipmi.rmcp_plus,
            self.pool,
            self.host.keys().cloned().collect::<Vec<_>>().join(", "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    const SAMPLE: &str = r#"
listen = "*:9090"
log_level = "debug"

[ipmi]
username = "ADMIN"
password = "secret"

[pool]
idle_timeout = "30s"

[host.venus]
address = "10.0.0.11"

[host.mars]
address = "10.0.0.12"
port = 1623
"#;

    #[test]
    fn test_parse_sample_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.parse_listen_addr().unwrap().port(), 9090);
        assert_eq!(config.pool.capacity, 1);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.pool.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.ipmi.timeout, Duration::from_secs(1));

        let targets = config.targets().unwrap();
        assert_eq!(targets.len(), 2);
        let mars = targets.iter().find(|t| t.name == "mars").unwrap();
        assert_eq!(mars.port, 1623);
        assert_eq!(mars.password(), "secret");
        let venus = targets.iter().find(|t| t.name == "venus").unwrap();
        assert_eq!(venus.port, DEFAULT_IPMI_PORT);
    }

    #[test]
    fn test_password_file_is_read_and_trimmed() {
        let dir = tempdir().unwrap();
        let secret = dir.path().join("ipmi-password");
        fs::write(&secret, "s3cr3t\n").unwrap();

        let mut config = Config::default();
        config.ipmi.password_file = Some(secret);
        config.resolve_password().unwrap();
        assert_eq!(config.ipmi.password.as_deref(), Some("s3cr3t"));
        assert!(config.ipmi.password_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_password_sources_are_exclusive() {
        let mut config = Config::default();
        config.ipmi.password = Some("a".into());
        assert!(config.resolve_password().is_err());

        config.ipmi.password_file = None;
        config.ipmi.password = None;
        assert!(config.resolve_password().is_err());

        config.ipmi.password_file = Some(PathBuf::from("/nonexistent/ipmi-password"));
        assert!(config.resolve_password().is_err());
    }

    #[test]
    fn test_parse_listen_addr() {
        let mut config = Config::default();
        config.listen = ListenConfig::String("localhost:8080".to_string());
        assert!(config.parse_listen_addr().is_ok());

        config.listen = ListenConfig::String("*:8080".to_string());
        assert_eq!(config.parse_listen_addr().unwrap().port(), 8080);

        config.listen = ListenConfig::String("8081".to_string());
        assert_eq!(config.parse_listen_addr().unwrap().port(), 8081);

        config.listen = ListenConfig::String("invalid".to_string());
        assert!(config.parse_listen_addr().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        // Password not resolved yet.
        assert!(config.validate().is_err());

        config.ipmi.password = Some("secret".into());
        config.ipmi.password_file = None;
        assert!(config.validate().is_ok());

        config.pool.capacity = 0;
        assert!(config.validate().is_err());
        config.pool.capacity = 1;

        config.pool.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_config_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipmi-power.toml");
        fs::write(dir.path().join("ipmi-password"), "pw").unwrap();

        let mut config = Config::default();
        config.ipmi.password_file = Some(dir.path().join("ipmi-password"));
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.ipmi.password.as_deref(), Some("pw"));
        assert_eq!(loaded.pool, PoolConfig::default());
        assert_eq!(loaded.host, config.host);
        assert!(!loaded.to_string().contains("pw\r"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("Info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
