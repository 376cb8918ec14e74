//! Port configuration.
//!
//! A port is described by a [`PortConfig`], either built directly or read
//! from a [`Properties`] bag — a name-keyed description tree whose concrete
//! encoding (device tree, TOML, a static table) is the embedder's choice.

use crate::message::pdo::{Capabilities, CapabilityError};
use crate::{PortType, PowerRole};

/// A read-only, name-keyed property bag describing the port connector.
pub trait Properties {
    /// Read a string property.
    fn read_str(&self, name: &str) -> Option<&str>;

    /// Read a `u32` property.
    fn read_u32(&self, name: &str) -> Option<u32>;

    /// Read an array of `u32` values.
    fn read_u32_array(&self, name: &str) -> Option<&[u32]>;

    /// Read a boolean flag; an absent flag reads as `false`.
    fn read_bool(&self, name: &str) -> bool;
}

/// Errors raised while loading or validating a port configuration. Fatal at
/// initialization; the port does not come up.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// A required property is missing.
    #[error("missing required property `{0}`")]
    MissingProperty(&'static str),
    /// A property value is not one of the recognized values.
    #[error("unrecognized value for property `{0}`")]
    InvalidProperty(&'static str),
    /// A PDO list violates the capability ordering rules.
    #[error("invalid capabilities")]
    InvalidCapabilities(#[from] CapabilityError),
}

/// Static description of a port, immutable once the port is initialized.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortConfig {
    /// Power capability of the port.
    pub port_type: PortType,
    /// Preferred role while toggling; only meaningful for DRP ports.
    pub try_role: PowerRole,
    /// Capabilities advertised when sourcing.
    pub src_pdo: Capabilities,
    /// Capabilities matched against a partner's advertisement when sinking.
    pub snk_pdo: Capabilities,
    /// Power the sink needs to operate, in mW.
    pub operating_snk_mw: u32,
    /// Whether the port belongs to a self-powered device.
    pub self_powered: bool,
}

impl PortConfig {
    /// Load a configuration from a connector property bag.
    pub fn from_properties(props: &impl Properties) -> Result<Self, ConfigError> {
        let port_type = match props.read_str("power-role") {
            Some("dual") => PortType::Drp,
            Some("source") => PortType::Source,
            Some("sink") => PortType::Sink,
            Some(_) => return Err(ConfigError::InvalidProperty("power-role")),
            None => return Err(ConfigError::MissingProperty("power-role")),
        };

        let mut config = Self {
            port_type,
            try_role: PowerRole::Sink,
            src_pdo: Capabilities::default(),
            snk_pdo: Capabilities::default(),
            operating_snk_mw: 0,
            self_powered: false,
        };

        if port_type != PortType::Sink {
            let words = props
                .read_u32_array("source-pdos")
                .filter(|words| !words.is_empty())
                .ok_or(ConfigError::MissingProperty("source-pdos"))?;
            config.src_pdo = Capabilities::from_words(words);
            config.src_pdo.validate()?;

            if port_type == PortType::Source {
                return Ok(config);
            }

            config.try_role = match props.read_str("try-power-role") {
                Some("sink") => PowerRole::Sink,
                Some("source") => PowerRole::Source,
                Some(_) => return Err(ConfigError::InvalidProperty("try-power-role")),
                None => return Err(ConfigError::MissingProperty("try-power-role")),
            };
        }

        let words = props
            .read_u32_array("sink-pdos")
            .filter(|words| !words.is_empty())
            .ok_or(ConfigError::MissingProperty("sink-pdos"))?;
        config.snk_pdo = Capabilities::from_words(words);
        config.snk_pdo.validate()?;

        let microwatt = props
            .read_u32("op-sink-microwatt")
            .ok_or(ConfigError::MissingProperty("op-sink-microwatt"))?;
        config.operating_snk_mw = microwatt / 1000;

        config.self_powered = props.read_bool("self-powered");

        Ok(config)
    }

    /// Validate a directly-built configuration against the same rules the
    /// property loader enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_type != PortType::Sink {
            if self.src_pdo.is_empty() {
                return Err(ConfigError::MissingProperty("source-pdos"));
            }
            self.src_pdo.validate()?;
        }

        if self.port_type != PortType::Source {
            if self.snk_pdo.is_empty() {
                return Err(ConfigError::MissingProperty("sink-pdos"));
            }
            self.snk_pdo.validate()?;
        }

        Ok(())
    }
}
