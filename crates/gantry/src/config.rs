//! Daemon configuration.
//!
//! A TOML file with defaulted sections, plus a small set of
//! environment overrides for quick local runs (`GANTRY_HTTP`,
//! `GANTRY_KLIPPY_UDS`, `GANTRY_DATA_PATH`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ServerError};
use crate::klippy::subscriptions::ObjectSubscription;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub klippy: KlippyConfig,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root for the database, the agent socket, and backups.
    pub data_path: PathBuf,
    /// Mount `/debug/...` endpoints over HTTP.
    pub enable_debug: bool,
    /// Identifier persisted to the database to detect another
    /// instance reusing the same store.
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 7125,
            data_path: "~/gantry_data".into(),
            enable_debug: false,
            instance_id: "gantry".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KlippyConfig {
    pub uds_address: PathBuf,
}

impl Default for KlippyConfig {
    fn default() -> Self {
        Self {
            uds_address: "/tmp/klippy_uds".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    pub address: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub instance_name: Option<String>,
    pub default_qos: u8,
    pub api_qos: Option<u8>,
    pub enable_moonraker_api: bool,
    /// Object name to comma-separated field list; an empty value
    /// subscribes to every field.
    pub status_objects: HashMap<String, String>,
    pub publish_split_status: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 1883,
            username: None,
            password: None,
            instance_name: None,
            default_qos: 0,
            api_qos: None,
            enable_moonraker_api: true,
            status_objects: HashMap::new(),
            publish_split_status: false,
        }
    }
}

impl MqttConfig {
    pub fn parsed_status_objects(&self) -> ObjectSubscription {
        self.status_objects
            .iter()
            .map(|(object, fields)| {
                let fields = if fields.trim().is_empty() {
                    None
                } else {
                    Some(
                        fields
                            .split(',')
                            .map(str::trim)
                            .filter(|field| !field.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                };
                (object.clone(), fields)
            })
            .collect()
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    ServerError::internal(format!(
                        "failed to read config file {}: {e}",
                        path.display()
                    ))
                })?;
                toml::from_str(&raw).map_err(|e| {
                    ServerError::internal(format!(
                        "failed to parse config file {}: {e}",
                        path.display()
                    ))
                })?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        config.server.data_path = expand_user(&config.server.data_path);
        config.klippy.uds_address = expand_user(&config.klippy.uds_address);
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("GANTRY_HTTP") {
            if let Some((host, port)) = listen.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    self.server.host = host.to_string();
                    self.server.port = port;
                }
            }
        }
        if let Ok(path) = std::env::var("GANTRY_KLIPPY_UDS") {
            self.klippy.uds_address = path.into();
        }
        if let Ok(path) = std::env::var("GANTRY_DATA_PATH") {
            self.server.data_path = path.into();
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(mqtt) = &self.mqtt {
            if mqtt.address.is_empty() {
                return Err(ServerError::internal(
                    "mqtt section requires an 'address' option",
                ));
            }
            for qos in [Some(mqtt.default_qos), mqtt.api_qos].into_iter().flatten() {
                if qos > 2 {
                    return Err(ServerError::internal("mqtt qos must be between 0 and 2"));
                }
            }
            if let Some(instance) = &mqtt.instance_name {
                if instance.contains('+') || instance.contains('#') {
                    return Err(ServerError::internal(
                        "mqtt instance_name cannot contain a wildcard",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.server.data_path.join("database").join("gantry-sql.db")
    }

    pub fn unix_socket_path(&self) -> PathBuf {
        self.server.data_path.join("comms").join("gantry.sock")
    }
}

fn expand_user(path: &Path) -> PathBuf {
    let Some(rest) = path.to_str().and_then(|p| p.strip_prefix("~/")) else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 7125);
        assert_eq!(config.klippy.uds_address, PathBuf::from("/tmp/klippy_uds"));
        assert!(config.mqtt.is_none());
    }

    #[test]
    fn mqtt_section_parses_status_objects() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            address = "broker.local"
            default_qos = 1

            [mqtt.status_objects]
            webhooks = ""
            toolhead = "position, homed_axes"
            "#,
        )
        .unwrap();
        let mqtt = config.mqtt.unwrap();
        let objects = mqtt.parsed_status_objects();
        assert_eq!(objects.get("webhooks"), Some(&None));
        assert_eq!(
            objects.get("toolhead"),
            Some(&Some(vec!["position".to_string(), "homed_axes".to_string()]))
        );
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            address = "broker.local"
            default_qos = 3
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("[server]\nbogus = 1\n").is_err());
    }
}
