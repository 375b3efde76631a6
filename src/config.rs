//! Server and client configuration
//!
//! Both configurations deserialize from YAML or JSON; every field has a
//! default so a file only needs to name what it changes.
//!
//! ```yaml
//! port: 1502
//! backlog: 1
//! unit_id: 1
//! overflow_policy: truncate
//! mapping:
//!   holding_registers: { start_address: 0, size: 32 }
//!   input_registers: { start_address: 0, size: 16 }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::connection::OverflowPolicy;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::LoggingMode;
use crate::mapping::MappingLayout;
use crate::protocol::{validate_unit_id, SlaveId};
use crate::{DEFAULT_BYTE_TIMEOUT_MS, DEFAULT_RESPONSE_TIMEOUT_MS, DEFAULT_TCP_PORT, TCP_SLAVE};

/// Server configuration surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port; 0 picks an ephemeral port
    pub port: u16,
    /// Pending-connection backlog handed to the stack
    pub backlog: u8,
    /// Only answer this unit ID; `None` answers every unit
    pub unit_id: Option<SlaveId>,
    pub mapping: MappingLayout,
    /// How long to wait for the first byte of a request; `None` waits forever
    pub indication_timeout_ms: Option<u64>,
    /// How long to wait between bytes of one frame
    pub byte_timeout_ms: u64,
    pub overflow_policy: OverflowPolicy,
    pub debug: bool,
    pub log_mode: LoggingMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_TCP_PORT,
            backlog: 2,
            unit_id: None,
            mapping: MappingLayout::default(),
            indication_timeout_ms: None,
            byte_timeout_ms: DEFAULT_BYTE_TIMEOUT_MS,
            overflow_policy: OverflowPolicy::Disconnect,
            debug: false,
            log_mode: LoggingMode::Raw,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        if self.backlog == 0 {
            return Err(ModbusError::configuration("Backlog must be at least 1"));
        }
        if let Some(unit_id) = self.unit_id {
            validate_unit_id(unit_id).map_err(|e| ModbusError::configuration(e.to_string()))?;
        }
        if self.byte_timeout_ms == 0 {
            return Err(ModbusError::configuration("Byte timeout must not be zero"));
        }
        self.mapping.validate()
    }

    pub fn indication_timeout(&self) -> Option<Duration> {
        self.indication_timeout_ms.map(Duration::from_millis)
    }

    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let config: Self = load_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

/// Client configuration surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub address: SocketAddr,
    /// Unit ID used by `ModbusTcpClient::request`; trait methods name their own
    pub unit_id: SlaveId,
    /// How long to wait for the first byte of a response
    pub response_timeout_ms: u64,
    pub byte_timeout_ms: u64,
    pub overflow_policy: OverflowPolicy,
    pub debug: bool,
    pub log_mode: LoggingMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_TCP_PORT)),
            unit_id: TCP_SLAVE,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            byte_timeout_ms: DEFAULT_BYTE_TIMEOUT_MS,
            overflow_policy: OverflowPolicy::Disconnect,
            debug: false,
            log_mode: LoggingMode::Raw,
        }
    }
}

impl ClientConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        validate_unit_id(self.unit_id).map_err(|e| ModbusError::configuration(e.to_string()))?;
        if self.response_timeout_ms == 0 || self.byte_timeout_ms == 0 {
            return Err(ModbusError::configuration("Timeouts must not be zero"));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn byte_timeout(&self) -> Duration {
        Duration::from_millis(self.byte_timeout_ms)
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let config: Self = load_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

fn load_file<T: DeserializeOwned>(path: &Path) -> ModbusResult<T> {
    let text = std::fs::read_to_string(path)?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&text)?),
        Some("json") => Ok(serde_json::from_str(&text)?),
        _ => Err(ModbusError::configuration(format!(
            "Unsupported configuration format: {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::TableLayout;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 502);
        assert_eq!(config.backlog, 2);
        assert_eq!(config.indication_timeout(), None);
        assert_eq!(config.byte_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_from_yaml() {
        let yaml = r#"
port: 1502
unit_id: 1
overflow_policy: truncate
indication_timeout_ms: 2000
mapping:
  holding_registers: { start_address: 100, size: 32 }
"#;
        let config = ServerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.port, 1502);
        assert_eq!(config.unit_id, Some(1));
        assert_eq!(config.overflow_policy, OverflowPolicy::Truncate);
        assert_eq!(config.indication_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.mapping.holding_registers, TableLayout::new(100, 32));
        assert_eq!(config.mapping.coils, MappingLayout::default().coils);
    }

    #[test]
    fn test_invalid_server_config() {
        assert!(ServerConfig::from_yaml_str("unit_id: 250").is_err());
        assert!(ServerConfig::from_yaml_str("backlog: 0").is_err());
        assert!(matches!(
            ServerConfig::from_yaml_str("port: [1, 2]"),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[test]
    fn test_client_from_json() {
        let json = r#"{ "address": "192.168.1.20:502", "unit_id": 17, "response_timeout_ms": 1000 }"#;
        let config = ClientConfig::from_json_str(json).unwrap();
        assert_eq!(config.address, "192.168.1.20:502".parse().unwrap());
        assert_eq!(config.unit_id, 17);
        assert_eq!(config.response_timeout(), Duration::from_secs(1));
        assert_eq!(config.byte_timeout_ms, 500);
    }

    #[test]
    fn test_unsupported_file_format() {
        let path = std::env::temp_dir().join("voltage_modbus_bridge_config.toml");
        std::fs::write(&path, "port = 1").unwrap();
        assert!(matches!(ServerConfig::from_file(&path), Err(ModbusError::Configuration { .. })));
        let _ = std::fs::remove_file(path);
    }
}
