//! Scripted port controller and manual clock for tests.
//!
//! The dummy controller records every hardware call the engine makes and
//! feeds back queued events when polled. The clock only moves when the
//! engine busy-waits or a test advances it.
use std::collections::VecDeque;
use std::vec::Vec;

use crate::message::Message;
use crate::message::header::SpecificationRevision;
use crate::tcpc::{CcPolarity, CcStatus, Event, Tcpc, TcpcError, TransmitStatus, TransmitType};
use crate::timers::Clock;
use crate::{DataRole, PortType, PowerRole};

/// How the dummy controller completes transmissions.
#[derive(Clone, Copy)]
pub enum TxBehavior {
    /// Report this status as soon as the engine polls for events.
    Auto(TransmitStatus),
    /// Never report completion; the engine observes a timeout.
    Stuck,
}

/// A scripted port controller.
pub struct DummyTcpc {
    /// VBUS level reported by `get_vbus`.
    pub vbus: bool,
    /// CC readings reported by `get_cc`.
    pub cc: (CcStatus, CcStatus),
    /// Events handed out by `poll_event`, in order.
    pub events: VecDeque<Event>,
    /// Every frame the engine transmitted.
    pub transmitted: Vec<(TransmitType, Option<Message>, SpecificationRevision)>,
    /// Transmission completion behavior.
    pub tx_behavior: TxBehavior,
    /// Whether `start_toggling` succeeds.
    pub supports_toggling: bool,
    /// Force `set_pd_rx` to fail.
    pub fail_pd_rx: bool,

    // Recorded hardware state.
    pub cc_req: CcStatus,
    pub polarity: Option<CcPolarity>,
    pub vconn: bool,
    pub vbus_source: bool,
    pub vbus_charge: bool,
    pub pd_rx: bool,
    pub roles: Option<(bool, PowerRole, DataRole)>,
    pub low_power: Option<(bool, bool)>,
    pub toggling: Option<(PortType, CcStatus)>,
}

impl DummyTcpc {
    pub fn new() -> Self {
        Self {
            vbus: false,
            cc: (CcStatus::Open, CcStatus::Open),
            events: VecDeque::new(),
            transmitted: Vec::new(),
            tx_behavior: TxBehavior::Auto(TransmitStatus::Success),
            supports_toggling: false,
            fail_pd_rx: false,
            cc_req: CcStatus::Open,
            polarity: None,
            vconn: false,
            vbus_source: false,
            vbus_charge: false,
            pd_rx: false,
            roles: None,
            low_power: None,
            toggling: None,
        }
    }

    /// The last transmitted frame.
    pub fn last_transmitted(&self) -> &(TransmitType, Option<Message>, SpecificationRevision) {
        self.transmitted.last().expect("nothing was transmitted")
    }
}

impl Tcpc for DummyTcpc {
    fn init(&mut self) -> Result<(), TcpcError> {
        Ok(())
    }

    fn get_vbus(&mut self) -> bool {
        self.vbus
    }

    fn set_cc(&mut self, cc: CcStatus) -> Result<(), TcpcError> {
        self.cc_req = cc;
        Ok(())
    }

    fn get_cc(&mut self) -> Result<(CcStatus, CcStatus), TcpcError> {
        Ok(self.cc)
    }

    fn set_polarity(&mut self, polarity: CcPolarity) -> Result<(), TcpcError> {
        self.polarity = Some(polarity);
        Ok(())
    }

    fn set_vconn(&mut self, enable: bool) -> Result<(), TcpcError> {
        self.vconn = enable;
        Ok(())
    }

    fn set_vbus(&mut self, enable: bool, charge: bool) -> Result<(), TcpcError> {
        self.vbus_source = enable;
        self.vbus_charge = charge;
        Ok(())
    }

    fn set_pd_rx(&mut self, enable: bool) -> Result<(), TcpcError> {
        if self.fail_pd_rx {
            return Err(TcpcError::Io);
        }
        self.pd_rx = enable;
        Ok(())
    }

    fn set_roles(
        &mut self,
        attached: bool,
        power_role: PowerRole,
        data_role: DataRole,
    ) -> Result<(), TcpcError> {
        self.roles = Some((attached, power_role, data_role));
        Ok(())
    }

    fn start_toggling(&mut self, port_type: PortType, cc: CcStatus) -> Result<(), TcpcError> {
        if !self.supports_toggling {
            return Err(TcpcError::Unsupported);
        }
        self.toggling = Some((port_type, cc));
        Ok(())
    }

    fn pd_transmit(
        &mut self,
        tx_type: TransmitType,
        message: Option<&Message>,
        revision: SpecificationRevision,
    ) -> Result<(), TcpcError> {
        self.transmitted.push((tx_type, message.cloned(), revision));
        if let TxBehavior::Auto(status) = self.tx_behavior {
            self.events.push_back(Event::TxComplete(status));
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn enter_low_power_mode(&mut self, attached: bool, pd_capable: bool) -> Result<(), TcpcError> {
        self.low_power = Some((attached, pd_capable));
        Ok(())
    }
}

/// A clock that only moves when the engine busy-waits or a test advances it.
pub struct FakeClock {
    now_us: u64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { now_us: 0 }
    }

    pub fn advance_ms(&mut self, ms: u32) {
        self.now_us += u64::from(ms) * 1000;
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now_us
    }

    fn delay_us(&mut self, us: u32) {
        self.now_us += u64::from(us);
    }
}
