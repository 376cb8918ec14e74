#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! USB Type-C Port Manager.
//!
//! A polled USB Power Delivery (revision 2.0/3.0) policy engine that drives a
//! low-level Type-C port controller. Given a [`tcpc::Tcpc`] implementation for
//! the hardware and a [`timers::Clock`] for time, a [`port::Port`] negotiates
//! attachment, power and data roles, and an explicit power contract with the
//! port partner.
//!
//! The engine is single-threaded and cooperative: an outer loop pumps
//! [`port::Port::poll`], the driver reports events synchronously, and all
//! state lives in the `Port`.

// This module must go first, so that the logging macros are visible to the
// other modules.
#[macro_use]
mod fmt;

pub mod config;
pub mod message;
pub mod port;
pub mod tcpc;
pub mod timers;

#[cfg(test)]
mod dummy;

pub use config::PortConfig;
pub use port::Port;

use crate::tcpc::TcpcError;

/// Power role of a port or of the VCONN supply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRole {
    /// Supplies power.
    Source,
    /// Consumes power.
    Sink,
}

impl From<bool> for PowerRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Sink,
            true => Self::Source,
        }
    }
}

impl From<PowerRole> for bool {
    fn from(role: PowerRole) -> bool {
        match role {
            PowerRole::Sink => false,
            PowerRole::Source => true,
        }
    }
}

/// Data role of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    /// Upstream-facing port (device).
    Ufp,
    /// Downstream-facing port (host).
    Dfp,
}

impl From<bool> for DataRole {
    fn from(value: bool) -> Self {
        match value {
            false => Self::Ufp,
            true => Self::Dfp,
        }
    }
}

impl From<DataRole> for bool {
    fn from(role: DataRole) -> bool {
        match role {
            DataRole::Ufp => false,
            DataRole::Dfp => true,
        }
    }
}

/// The power capability of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortType {
    /// Source only.
    Source,
    /// Sink only.
    Sink,
    /// Dual-role power port, may operate as either source or sink.
    Drp,
}

/// Runtime errors of the policy engine.
///
/// Configuration errors are reported separately, as [`config::ConfigError`],
/// and are fatal at initialization.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An argument did not pass validation. No state was changed.
    #[error("invalid argument")]
    InvalidArgument,
    /// A deadline elapsed, e.g. while waiting for transmit completion.
    #[error("timed out")]
    Timeout,
    /// A transient failure, e.g. a discarded frame. Retried by the state
    /// machine.
    #[error("transient failure")]
    Transient,
    /// The port controller reported a hardware fault.
    #[error("hardware error")]
    Hardware,
    /// The operation is not supported.
    #[error("not supported")]
    Unsupported,
}

impl From<TcpcError> for Error {
    fn from(error: TcpcError) -> Self {
        match error {
            TcpcError::Io => Error::Hardware,
            TcpcError::Unsupported => Error::Unsupported,
        }
    }
}
