//! Port controller interface.
//!
//! The [`Tcpc`] trait is implemented by the hardware driver. It provides the
//! primitives the policy engine needs: CC line sensing and termination,
//! VBUS/VCONN control, and PD frame transmission. The driver reports
//! asynchronous hardware activity as [`Event`]s from [`Tcpc::poll_event`];
//! events carry payload only, routing back into the port happens in the
//! engine.

use crate::message::Message;
use crate::message::header::SpecificationRevision;
use crate::{DataRole, PortType, PowerRole};

/// State of a single CC line, as sensed by the port controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcStatus {
    /// Line is open.
    Open,
    /// Powered-accessory pull-down.
    Ra,
    /// Device pull-down.
    Rd,
    /// Host pull-up advertising default USB current.
    RpDef,
    /// Host pull-up advertising 1.5 A.
    Rp1_5,
    /// Host pull-up advertising 3.0 A.
    Rp3_0,
}

/// Orientation of the connector; selects which CC line carries signaling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcPolarity {
    /// CC1 is the active line.
    Cc1,
    /// CC2 is the active line.
    Cc2,
}

/// Start-of-packet variant for an outbound PD frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum TransmitType {
    Sop = 0,
    SopPrime = 1,
    SopPrimePrime = 2,
    SopDebugPrime = 3,
    SopDebugPrimePrime = 4,
    HardReset = 5,
    CableReset = 6,
    BistMode2 = 7,
}

/// Outcome of a PD frame transmission, reported via
/// [`Event::TxComplete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransmitStatus {
    /// GoodCRC received, frame delivered.
    Success,
    /// Frame lost to a collision or concurrent reception; retryable.
    Discarded,
    /// Transmission failed.
    Failed,
}

/// Errors reported by the port controller.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcpcError {
    /// Hardware access failed.
    #[error("hardware access failed")]
    Io,
    /// The controller does not implement this operation.
    #[error("not supported")]
    Unsupported,
}

/// A hardware event, surfaced while the engine polls the controller.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// One of the CC lines changed; the engine re-samples via
    /// [`Tcpc::get_cc`].
    CcChange,
    /// VBUS crossed a detection threshold; the engine re-samples via
    /// [`Tcpc::get_vbus`].
    VbusChange,
    /// A PD message arrived and was already acknowledged with GoodCRC by the
    /// PHY.
    PdMessage(Message),
    /// Hard Reset signaling was received.
    HardReset,
    /// A previously started transmission completed.
    TxComplete(TransmitStatus),
}

/// Operations the hardware driver provides to the policy engine.
///
/// All operations are synchronous and non-blocking. [`Tcpc::pd_transmit`]
/// only starts a transmission; its completion is reported later as an
/// [`Event::TxComplete`].
pub trait Tcpc {
    /// Bring the controller up.
    fn init(&mut self) -> Result<(), TcpcError>;

    /// Whether VBUS is above the vSafe5V minimum.
    fn get_vbus(&mut self) -> bool;

    /// Drive the local CC termination.
    fn set_cc(&mut self, cc: CcStatus) -> Result<(), TcpcError>;

    /// Sample both CC lines.
    fn get_cc(&mut self) -> Result<(CcStatus, CcStatus), TcpcError>;

    /// Select the active CC line.
    fn set_polarity(&mut self, polarity: CcPolarity) -> Result<(), TcpcError>;

    /// Enable or disable the VCONN supply.
    fn set_vconn(&mut self, enable: bool) -> Result<(), TcpcError>;

    /// Enable or disable VBUS sourcing, or sink charging.
    fn set_vbus(&mut self, enable: bool, charge: bool) -> Result<(), TcpcError>;

    /// Enable or disable reception of PD messages.
    fn set_pd_rx(&mut self, enable: bool) -> Result<(), TcpcError>;

    /// Inform the PHY of the current connection state and roles.
    fn set_roles(
        &mut self,
        attached: bool,
        power_role: PowerRole,
        data_role: DataRole,
    ) -> Result<(), TcpcError>;

    /// Start hardware-driven DRP toggling or single-role connection
    /// detection. Toggling stops by itself once a connection is established.
    ///
    /// Optional; the engine falls back to software toggling when the
    /// controller reports [`TcpcError::Unsupported`].
    fn start_toggling(&mut self, port_type: PortType, cc: CcStatus) -> Result<(), TcpcError> {
        let _ = (port_type, cc);
        Err(TcpcError::Unsupported)
    }

    /// Start transmission of a PD frame. `message` is `None` for frame types
    /// without payload, such as hard reset signaling.
    fn pd_transmit(
        &mut self,
        tx_type: TransmitType,
        message: Option<&Message>,
        revision: SpecificationRevision,
    ) -> Result<(), TcpcError>;

    /// Process pending hardware interrupts, handing back at most one event
    /// per call. The engine drains this until it returns `None`.
    fn poll_event(&mut self) -> Option<Event>;

    /// Enter low power mode once the port has settled.
    ///
    /// Optional; [`TcpcError::Unsupported`] means the controller has no such
    /// mode.
    fn enter_low_power_mode(&mut self, attached: bool, pd_capable: bool) -> Result<(), TcpcError> {
        let _ = (attached, pd_capable);
        Err(TcpcError::Unsupported)
    }
}
