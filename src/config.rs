//! Reader configuration
//!
//! Settings are loaded from a YAML file, every field falls back to its default when it is
//! missing, and command line overrides are applied on top before the reader starts.
//!
//! ```yaml
//! endpoint:
//!   host: 10.209.67.120
//!   port: 502
//!   unit_id: 1
//!   timeout_ms: 1000
//! register:
//!   kind: input
//!   address: 30000
//!   conversion: numeric
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use crate::tcp::{self, MODBUS_TCP_DEFAULT_PORT};
use crate::{Conversion, RegisterKind};

/// Default register address, the first 3xxxx input register of the controller.
pub const DEFAULT_REGISTER_ADDRESS: u16 = 30000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the controller lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Modbus unit identifier placed in every request header.
    pub unit_id: u8,
    /// Bound for connecting and for each read. `None` waits as long as the socket does.
    pub timeout_ms: Option<u64>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: MODBUS_TCP_DEFAULT_PORT,
            unit_id: 1,
            timeout_ms: None,
        }
    }
}

impl Endpoint {
    pub fn transport_config(&self) -> tcp::Config {
        tcp::Config {
            tcp_port: self.port,
            tcp_timeout: self.timeout_ms.map(Duration::from_millis),
            modbus_uid: self.unit_id,
        }
    }
}

/// Which register every trigger reads and how the reply is turned into a float.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Register {
    pub kind: RegisterKind,
    pub address: u16,
    pub conversion: Conversion,
}

impl Default for Register {
    fn default() -> Self {
        Self {
            kind: RegisterKind::Input,
            address: DEFAULT_REGISTER_ADDRESS,
            conversion: Conversion::Numeric,
        }
    }
}

impl Register {
    /// Number of registers requested per read.
    pub fn count(&self) -> u16 {
        self.conversion.register_count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub endpoint: Endpoint,
    pub register: Register,
}

/// Values given on the command line. `None` keeps what the file (or default) says.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unit_id: Option<u8>,
    pub timeout_ms: Option<u64>,
    pub kind: Option<RegisterKind>,
    pub address: Option<u16>,
    pub conversion: Option<Conversion>,
}

impl Settings {
    /// Load and validate settings from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("loading configuration from {:?}", path);
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint host must not be empty".into()));
        }
        if self.endpoint.port == 0 {
            return Err(ConfigError::Invalid("endpoint port must not be 0".into()));
        }
        if self.endpoint.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("timeout_ms must be greater than 0".into()));
        }
        if self.register.address.checked_add(self.register.count() - 1).is_none() {
            return Err(ConfigError::Invalid(format!(
                "register range starting at {} exceeds the address space",
                self.register.address
            )));
        }
        Ok(())
    }

    /// Apply command line overrides, then validate the result again.
    pub fn apply_args(&mut self, args: Overrides) -> Result<(), ConfigError> {
        if let Some(host) = args.host {
            debug!("overriding host from command line: {}", host);
            self.endpoint.host = host;
        }
        if let Some(port) = args.port {
            debug!("overriding port from command line: {}", port);
            self.endpoint.port = port;
        }
        if let Some(unit_id) = args.unit_id {
            debug!("overriding unit id from command line: {}", unit_id);
            self.endpoint.unit_id = unit_id;
        }
        if let Some(timeout_ms) = args.timeout_ms {
            debug!("overriding timeout from command line: {}ms", timeout_ms);
            self.endpoint.timeout_ms = Some(timeout_ms);
        }
        if let Some(kind) = args.kind {
            debug!("overriding register kind from command line: {:?}", kind);
            self.register.kind = kind;
        }
        if let Some(address) = args.address {
            debug!("overriding register address from command line: {}", address);
            self.register.address = address;
        }
        if let Some(conversion) = args.conversion {
            debug!("overriding conversion from command line: {:?}", conversion);
            self.register.conversion = conversion;
        }
        self.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.endpoint.port, 502);
        assert_eq!(settings.endpoint.unit_id, 1);
        assert_eq!(settings.endpoint.timeout_ms, None);
        assert_eq!(settings.register.kind, RegisterKind::Input);
        assert_eq!(settings.register.address, 30000);
        assert_eq!(settings.register.conversion, Conversion::Numeric);
        assert_eq!(settings.register.count(), 1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let settings = Settings::from_yaml("endpoint:\n  host: 10.209.67.120\n").unwrap();
        assert_eq!(settings.endpoint.host, "10.209.67.120");
        assert_eq!(settings.endpoint.port, 502);
        assert_eq!(settings.register, Register::default());
    }

    #[test]
    fn full_yaml() {
        let yaml = "
endpoint:
  host: plc.local
  port: 1502
  unit_id: 10
  timeout_ms: 250
register:
  kind: holding
  address: 0
  conversion: word_pair
";
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.endpoint.unit_id, 10);
        assert_eq!(settings.register.kind, RegisterKind::Holding);
        assert_eq!(settings.register.conversion, Conversion::WordPair);
        assert_eq!(settings.register.count(), 2);

        let cfg = settings.endpoint.transport_config();
        assert_eq!(cfg.tcp_port, 1502);
        assert_eq!(cfg.modbus_uid, 10);
        assert_eq!(cfg.tcp_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(Settings::from_yaml("endpoint:\n  host: ''\n"),
                         Err(ConfigError::Invalid(_))));
        assert!(matches!(Settings::from_yaml("endpoint:\n  port: 0\n"),
                         Err(ConfigError::Invalid(_))));
        assert!(matches!(Settings::from_yaml("endpoint:\n  timeout_ms: 0\n"),
                         Err(ConfigError::Invalid(_))));
        assert!(matches!(
            Settings::from_yaml("register:\n  address: 65535\n  conversion: word_pair\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(Settings::from_yaml("register:\n  kind: coil\n"),
                         Err(ConfigError::Parse(_))));
    }

    #[test]
    fn overrides() {
        let mut settings = Settings::default();
        settings
            .apply_args(Overrides {
                host: Some("10.209.67.120".into()),
                address: Some(0),
                conversion: Some(Conversion::HighWord),
                ..Overrides::default()
            })
            .unwrap();
        assert_eq!(settings.endpoint.host, "10.209.67.120");
        assert_eq!(settings.endpoint.port, 502);
        assert_eq!(settings.register.address, 0);
        assert_eq!(settings.register.conversion, Conversion::HighWord);

        assert!(settings
            .apply_args(Overrides { port: Some(0), ..Overrides::default() })
            .is_err());
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "register:\n  address: 30010").unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.register.address, 30010);

        assert!(matches!(Settings::from_file("/nonexistent/modbus-bridge.yaml"),
                         Err(ConfigError::Read { .. })));
    }
}
