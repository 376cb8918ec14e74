//! The port: all state for one USB-C receptacle, the hardware helpers, and
//! the consumer surface.
//!
//! A [`Port`] owns its [`Tcpc`] driver and [`Clock`]. Everything runs on the
//! caller's thread: the outer loop pumps [`Port::poll`], the driver reports
//! events during the pump, and the state machine reacts until quiescent.

mod events;
mod state_machine;

#[cfg(test)]
mod tests;

pub(crate) use state_machine::PortState;

use crate::config::{ConfigError, PortConfig};
use crate::message::header::{
    ControlMessageType, DataMessageType, Header, SpecificationRevision,
};
use crate::message::pdo::Capabilities;
use crate::message::request::{self, RawRequest, RequestError};
use crate::message::{Message, Payload};
use crate::tcpc::{CcPolarity, CcStatus, Tcpc, TcpcError, TransmitStatus, TransmitType};
use crate::timers::{Clock, Deadline, PD_T_TCPC_TX_TIMEOUT};
use crate::{DataRole, Error, PortType, PowerRole};

/// Iterations of the poll pump without activity before giving up for this
/// pump (2000 × 500 µs = 1 s).
const POLL_EVENT_TIMEOUT: u32 = 2000;

/// An outbound message queued from an inbound handler, drained by the state
/// machine before the next transition. At most one is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum QueuedMessage {
    None,
    CtrlReject,
    CtrlWait,
    CtrlNotSupp,
    DataSinkCap,
    DataSourceCap,
}

/// A single USB-C port, driven by the policy engine.
pub struct Port<TCPC: Tcpc, CLOCK: Clock> {
    pub(crate) tcpc: TCPC,
    pub(crate) clock: CLOCK,

    // Configured capabilities, immutable after init.
    pub(crate) port_type: PortType,
    pub(crate) try_role: PowerRole,
    pub(crate) src_pdo: Capabilities,
    pub(crate) snk_pdo: Capabilities,
    pub(crate) operating_snk_mw: u32,
    pub(crate) self_powered: bool,

    // Line state.
    pub(crate) cc_req: CcStatus,
    pub(crate) cc1: CcStatus,
    pub(crate) cc2: CcStatus,
    pub(crate) polarity: CcPolarity,
    pub(crate) vbus_present: bool,
    pub(crate) vbus_vsafe0v: bool,
    pub(crate) vbus_never_low: bool,
    pub(crate) vbus_source: bool,
    pub(crate) vbus_charge: bool,

    // Role state.
    pub(crate) pwr_role: PowerRole,
    pub(crate) data_role: DataRole,
    pub(crate) vconn_role: PowerRole,
    pub(crate) attached: bool,
    pub(crate) connected: bool,

    // Contract state.
    pub(crate) negotiated_rev: SpecificationRevision,
    pub(crate) explicit_contract: bool,
    pub(crate) pd_capable: bool,
    pub(crate) message_id: u8,
    /// MessageID of the last accepted inbound message; `None` until the
    /// first message after a reset.
    pub(crate) rx_msgid: Option<u8>,
    pub(crate) caps_count: u32,
    pub(crate) hard_reset_count: u32,
    pub(crate) source_caps: Capabilities,
    pub(crate) sink_caps: Capabilities,
    pub(crate) sink_request: RawRequest,

    // Contract result.
    pub(crate) req_current_limit: u32,
    pub(crate) req_supply_voltage: u32,
    pub(crate) current_limit: u32,
    pub(crate) supply_voltage: u32,

    // State machine control.
    pub(crate) state: PortState,
    pub(crate) prev_state: PortState,
    pub(crate) enter_state: PortState,
    pub(crate) delayed_state: PortState,
    pub(crate) delay_ms: u32,
    pub(crate) delay_timer: Deadline,
    pub(crate) state_machine_running: bool,
    pub(crate) queued_message: QueuedMessage,
    pub(crate) tx_complete: bool,
    pub(crate) tx_status: TransmitStatus,
    pub(crate) poll_event_cnt: u32,
    pub(crate) wait_dr_swap_message: bool,
}

pub(crate) fn cc_is_sink(cc: CcStatus) -> bool {
    matches!(cc, CcStatus::RpDef | CcStatus::Rp1_5 | CcStatus::Rp3_0)
}

pub(crate) fn cc_is_source(cc: CcStatus) -> bool {
    cc == CcStatus::Rd
}

impl<TCPC: Tcpc, CLOCK: Clock> Port<TCPC, CLOCK> {
    /// Create and initialize a port.
    ///
    /// Validates the configuration, brings the controller up, resets the
    /// port, seeds VBUS and CC state, and enters the default unattached
    /// state.
    pub fn new(tcpc: TCPC, clock: CLOCK, config: PortConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut port = Self {
            tcpc,
            clock,
            port_type: config.port_type,
            try_role: config.try_role,
            src_pdo: config.src_pdo,
            snk_pdo: config.snk_pdo,
            operating_snk_mw: config.operating_snk_mw,
            self_powered: config.self_powered,
            cc_req: CcStatus::Open,
            cc1: CcStatus::Open,
            cc2: CcStatus::Open,
            polarity: CcPolarity::Cc1,
            vbus_present: false,
            vbus_vsafe0v: true,
            vbus_never_low: false,
            vbus_source: false,
            vbus_charge: false,
            pwr_role: PowerRole::Sink,
            data_role: DataRole::Ufp,
            vconn_role: PowerRole::Sink,
            attached: false,
            connected: false,
            negotiated_rev: SpecificationRevision::R3_0,
            explicit_contract: false,
            pd_capable: false,
            message_id: 0,
            rx_msgid: None,
            caps_count: 0,
            hard_reset_count: 0,
            source_caps: Capabilities::default(),
            sink_caps: Capabilities::default(),
            sink_request: RawRequest(0),
            req_current_limit: 0,
            req_supply_voltage: 0,
            current_limit: 0,
            supply_voltage: 0,
            state: PortState::Invalid,
            prev_state: PortState::Invalid,
            enter_state: PortState::Invalid,
            delayed_state: PortState::Invalid,
            delay_ms: 0,
            delay_timer: Deadline::default(),
            state_machine_running: false,
            queued_message: QueuedMessage::None,
            tx_complete: false,
            tx_status: TransmitStatus::Failed,
            poll_event_cnt: 0,
            wait_dr_swap_message: false,
        };

        port.init();
        info!("port init finished");

        Ok(port)
    }

    fn init(&mut self) {
        if self.tcpc.init().is_err() {
            error!("port controller init failed");
        }

        self.reset_port();

        self.vbus_present = self.tcpc.get_vbus();
        if self.vbus_present {
            // Already powered at startup; a stable contract may predate us.
            self.vbus_never_low = true;
        }
        self.vbus_vsafe0v = !self.vbus_present;

        self.set_state(self.default_state(), 0);

        if let Ok((cc1, cc2)) = self.tcpc.get_cc() {
            self.handle_cc_change(cc1, cc2);
        }
    }

    /// Voltage of the negotiated contract in mV; 0 without an explicit
    /// contract.
    pub fn voltage(&self) -> u32 {
        self.supply_voltage
    }

    /// Current limit of the negotiated contract in mA; 0 without an explicit
    /// contract.
    pub fn current(&self) -> u32 {
        self.current_limit
    }

    /// Name of the current port state, for status read-outs.
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    #[cfg(test)]
    pub(crate) fn tcpc(&mut self) -> &mut TCPC {
        &mut self.tcpc
    }

    #[cfg(test)]
    pub(crate) fn clock(&mut self) -> &mut CLOCK {
        &mut self.clock
    }

    // Line-state helpers.

    pub(crate) fn port_is_sink(&self) -> bool {
        (cc_is_sink(self.cc1) && !cc_is_sink(self.cc2))
            || (cc_is_sink(self.cc2) && !cc_is_sink(self.cc1))
    }

    pub(crate) fn port_is_source(&self) -> bool {
        (cc_is_source(self.cc1) && !cc_is_source(self.cc2))
            || (cc_is_source(self.cc2) && !cc_is_source(self.cc1))
    }

    pub(crate) fn port_is_disconnected(&self) -> bool {
        (!self.attached && self.cc1 == CcStatus::Open && self.cc2 == CcStatus::Open)
            || (self.attached
                && ((self.polarity == CcPolarity::Cc1 && self.cc1 == CcStatus::Open)
                    || (self.polarity == CcPolarity::Cc2 && self.cc2 == CcStatus::Open)))
    }

    pub(crate) fn try_src(&self) -> bool {
        self.try_role == PowerRole::Source && self.port_type == PortType::Drp
    }

    /// Rp value to advertise when presenting as source, from the maximum
    /// current of the 5 V source PDO.
    pub(crate) fn rp_cc(&self) -> CcStatus {
        if let Some(vsafe_5v) = self.src_pdo.vsafe_5v() {
            let current_ma = vsafe_5v.max_current_ma();
            if current_ma >= 3000 {
                return CcStatus::Rp3_0;
            } else if current_ma >= 1500 {
                return CcStatus::Rp1_5;
            }
        }

        CcStatus::RpDef
    }

    /// Type-C (non-PD) current limit advertised by the partner's Rp on the
    /// active CC line, in mA.
    pub(crate) fn typec_current_limit(&self) -> u32 {
        let cc = match self.polarity {
            CcPolarity::Cc1 => self.cc1,
            CcPolarity::Cc2 => self.cc2,
        };

        match cc {
            CcStatus::Rp1_5 => 1500,
            CcStatus::Rp3_0 => 3000,
            _ => 0,
        }
    }

    // Hardware helpers. These mirror the driver call with the port-side
    // bookkeeping that must follow it.

    pub(crate) fn set_cc(&mut self, cc: CcStatus) {
        debug!("set cc = {:?}", cc);
        self.cc_req = cc;
        if self.tcpc.set_cc(cc).is_err() {
            error!("failed to set CC termination");
        }
    }

    pub(crate) fn set_polarity(&mut self, polarity: CcPolarity) -> Result<(), Error> {
        debug!("set polarity = {:?}", polarity);
        self.tcpc.set_polarity(polarity)?;
        self.polarity = polarity;
        Ok(())
    }

    pub(crate) fn set_vconn(&mut self, enable: bool) -> Result<(), Error> {
        debug!("set vconn = {}", enable);
        self.tcpc.set_vconn(enable)?;
        self.vconn_role = if enable {
            PowerRole::Source
        } else {
            PowerRole::Sink
        };
        Ok(())
    }

    /// Enable or disable sourcing VBUS. Sourcing while sink charging is
    /// enabled is forbidden.
    pub(crate) fn set_vbus(&mut self, enable: bool) -> Result<(), Error> {
        if enable && self.vbus_charge {
            return Err(Error::InvalidArgument);
        }

        debug!("set vbus = {} charge = {}", enable, self.vbus_charge);
        self.tcpc.set_vbus(enable, self.vbus_charge)?;
        self.vbus_source = enable;
        Ok(())
    }

    /// Enable or disable sink charging from VBUS. Charging while sourcing is
    /// forbidden.
    pub(crate) fn set_charge(&mut self, charge: bool) -> Result<(), Error> {
        if charge && self.vbus_source {
            return Err(Error::InvalidArgument);
        }

        if charge != self.vbus_charge {
            debug!("set vbus = {} charge = {}", self.vbus_source, charge);
            self.tcpc.set_vbus(self.vbus_source, charge)?;
        }
        self.vbus_charge = charge;
        Ok(())
    }

    fn init_vbus(&mut self) {
        if self.tcpc.set_vbus(false, false).is_err() {
            error!("failed to disable vbus");
        }
        self.vbus_source = false;
        self.vbus_charge = false;
    }

    fn init_vconn(&mut self) {
        if self.tcpc.set_vconn(false).is_err() {
            error!("failed to disable vconn");
        }
        self.vconn_role = PowerRole::Sink;
    }

    pub(crate) fn set_roles(
        &mut self,
        attached: bool,
        power_role: PowerRole,
        data_role: DataRole,
    ) -> Result<(), Error> {
        self.tcpc.set_roles(attached, power_role, data_role)?;
        self.pwr_role = power_role;
        self.data_role = data_role;
        Ok(())
    }

    /// Inform the PHY of the attachment state without changing roles.
    pub(crate) fn set_attached_state(&mut self, attached: bool) {
        if self
            .tcpc
            .set_roles(attached, self.pwr_role, self.data_role)
            .is_err()
        {
            error!("failed to set attached state");
        }
    }

    /// Record the negotiated limits. Physical enforcement is the port
    /// controller's business.
    pub(crate) fn set_current_limit(&mut self, max_ma: u32, mv: u32) {
        info!("set voltage limit = {} mV, current limit = {} mA", mv, max_ma);
        self.supply_voltage = mv;
        self.current_limit = max_ma;
    }

    pub(crate) fn start_toggling(&mut self, cc: CcStatus) -> bool {
        match self.tcpc.start_toggling(self.port_type, cc) {
            Ok(()) => {
                debug!("start toggling");
                true
            }
            Err(_) => false,
        }
    }

    fn typec_connect(&mut self) {
        if !self.connected {
            self.connected = true;
        }
    }

    fn typec_disconnect(&mut self) {
        if self.connected {
            self.connected = false;
        }
    }

    pub(crate) fn src_attach(&mut self) -> Result<(), Error> {
        if self.attached {
            return Ok(());
        }

        let polarity = if self.cc2 == CcStatus::Rd {
            CcPolarity::Cc2
        } else {
            CcPolarity::Cc1
        };
        self.set_polarity(polarity)?;
        self.set_roles(true, PowerRole::Source, DataRole::Dfp)?;

        if self.tcpc.set_pd_rx(true).is_err() {
            error!("failed to enable PD RX as source");
        }

        // Enable VCONN only if the non-Rd line reads Ra.
        if (polarity == CcPolarity::Cc1 && self.cc2 == CcStatus::Ra)
            || (polarity == CcPolarity::Cc2 && self.cc1 == CcStatus::Ra)
        {
            if let Err(err) = self.set_vconn(true) {
                warn!("failed to enable vconn: {:?}", err);
            }
        }

        if let Err(err) = self.set_vbus(true) {
            warn!("failed to enable vbus: {:?}", err);
        }

        self.pd_capable = false;
        self.attached = true;
        info!(
            "CC connected in {} as DFP",
            if polarity == CcPolarity::Cc2 { "CC2" } else { "CC1" }
        );

        Ok(())
    }

    pub(crate) fn snk_attach(&mut self) -> Result<(), Error> {
        if self.attached {
            return Ok(());
        }

        self.set_polarity(if self.cc2 != CcStatus::Open {
            CcPolarity::Cc2
        } else {
            CcPolarity::Cc1
        })?;
        self.set_roles(true, PowerRole::Sink, DataRole::Ufp)?;

        self.pd_capable = false;
        self.attached = true;
        info!(
            "CC connected in {} as UFP",
            if self.cc1 != CcStatus::Open { "CC1" } else { "CC2" }
        );

        Ok(())
    }

    /// Drop all connection and contract state and return the hardware to its
    /// detached defaults.
    pub(crate) fn reset_port(&mut self) {
        self.delay_timer.disarm();
        self.typec_disconnect();
        self.poll_event_cnt = 0;
        self.wait_dr_swap_message = false;
        self.attached = false;
        self.pd_capable = false;

        // The first RX MessageID after a reset must always be accepted.
        self.rx_msgid = None;

        if self.tcpc.set_pd_rx(false).is_err() {
            error!("failed to disable PD RX");
        }
        self.init_vbus();
        self.init_vconn();
        self.set_current_limit(0, 0);
        let _ = self.set_polarity(CcPolarity::Cc1);
        self.set_attached_state(false);
        self.sink_caps.clear();
    }

    pub(crate) fn detach(&mut self) {
        if self.port_is_disconnected() {
            self.hard_reset_count = 0;
        }

        if !self.attached {
            return;
        }

        self.reset_port();
    }

    // Message transmission.

    /// Start a transmission and wait for its completion, pumping driver
    /// events and the transition deadline in 1 ms slices.
    ///
    /// The MessageID advances only after a successful transmit.
    pub(crate) fn pd_transmit(
        &mut self,
        tx_type: TransmitType,
        message: Option<&Message>,
    ) -> Result<(), Error> {
        if let Some(message) = message {
            debug!("PD TX, header: {:#x}", message.header.0);
        } else {
            debug!("PD TX, type: {:?}", tx_type);
        }

        self.tx_complete = false;
        self.tcpc.pd_transmit(tx_type, message, self.negotiated_rev)?;

        let mut timeout = PD_T_TCPC_TX_TIMEOUT;
        while timeout > 0 && !self.tx_complete {
            self.poll_tcpc();
            if self.tx_complete {
                break;
            }
            self.clock.delay_us(1000);
            timeout -= 1;
            self.check_delayed_work();
        }

        if !self.tx_complete {
            error!("PD transmit timed out");
            return Err(Error::Timeout);
        }

        match self.tx_status {
            TransmitStatus::Success => {
                self.message_id = (self.message_id + 1) & 0x7;
                Ok(())
            }
            TransmitStatus::Discarded => Err(Error::Transient),
            TransmitStatus::Failed => Err(Error::Hardware),
        }
    }

    fn control_header(&self, message_type: ControlMessageType) -> Header {
        Header::new_control(
            self.data_role,
            self.pwr_role,
            self.negotiated_rev,
            self.message_id,
            message_type,
        )
    }

    fn data_header(&self, message_type: DataMessageType, num_objects: u8) -> Header {
        Header::new_data(
            self.data_role,
            self.pwr_role,
            self.negotiated_rev,
            self.message_id,
            message_type,
            num_objects,
        )
    }

    pub(crate) fn pd_send_control(&mut self, message_type: ControlMessageType) -> Result<(), Error> {
        let message = Message::new(self.control_header(message_type));
        self.pd_transmit(TransmitType::Sop, Some(&message))
    }

    /// Advertise the local source capabilities, or reject if there are none.
    pub(crate) fn pd_send_source_caps(&mut self) -> Result<(), Error> {
        let message = if self.src_pdo.is_empty() {
            Message::new(self.control_header(ControlMessageType::Reject))
        } else {
            Message::new_with_payload(
                self.data_header(DataMessageType::SourceCapabilities, self.src_pdo.len() as u8),
                Payload::SourceCapabilities(self.src_pdo.clone()),
            )
        };

        self.pd_transmit(TransmitType::Sop, Some(&message))
    }

    /// Advertise the local sink capabilities, or reject if there are none.
    pub(crate) fn pd_send_sink_caps(&mut self) -> Result<(), Error> {
        let message = if self.snk_pdo.is_empty() {
            Message::new(self.control_header(ControlMessageType::Reject))
        } else {
            Message::new_with_payload(
                self.data_header(DataMessageType::SinkCapabilities, self.snk_pdo.len() as u8),
                Payload::SinkCapabilities(self.snk_pdo.clone()),
            )
        };

        self.pd_transmit(TransmitType::Sop, Some(&message))
    }

    /// Build and send a request against the stored partner capabilities.
    pub(crate) fn pd_send_request(&mut self) -> Result<(), Error> {
        debug!(
            "cc = {:?}, cc1 = {:?}, cc2 = {:?}, vbus = {}, vconn = {:?}, polarity = {:?}",
            self.cc_req, self.cc1, self.cc2, self.vbus_source, self.vconn_role, self.polarity
        );

        let built = request::build_request(&self.source_caps, &self.snk_pdo, self.operating_snk_mw)
            .map_err(|_| Error::InvalidArgument)?;

        self.req_current_limit = built.current_limit_ma;
        self.req_supply_voltage = built.supply_voltage_mv;

        let message = Message::new_with_payload(
            self.data_header(DataMessageType::Request, 1),
            Payload::Request(built.rdo),
        );
        self.pd_transmit(TransmitType::Sop, Some(&message))
    }

    /// Validate the stored inbound request against the local source
    /// capabilities.
    pub(crate) fn pd_check_request(&self) -> Result<(), RequestError> {
        request::check_request(self.sink_request, &self.src_pdo)
    }

    /// Fire the transition deadline if it has elapsed.
    pub(crate) fn check_delayed_work(&mut self) {
        if self.delay_timer.fired(self.clock.now_us()) {
            self.delay_timer.disarm();
            if !self.state_machine_running {
                self.state_machine();
            }
        }
    }

    /// Pump one round of events, as described by the event facade. While the
    /// port is settling, keeps polling the controller for up to a second of
    /// inactivity; afterwards, optionally drops the controller into low
    /// power mode.
    pub fn poll(&mut self) {
        if !self.tcpc.get_vbus() {
            return;
        }

        while self.poll_event_cnt < POLL_EVENT_TIMEOUT {
            if !self.wait_dr_swap_message
                && matches!(self.state, PortState::SrcReady | PortState::SnkReady)
            {
                break;
            }

            self.poll_tcpc();
            self.poll_event_cnt += 1;
            self.clock.delay_us(500);
            self.check_delayed_work();
        }

        if !matches!(self.state, PortState::SrcReady | PortState::SnkReady) {
            warn!("poll loop exited in state {}", self.state_name());
        }

        match self
            .tcpc
            .enter_low_power_mode(self.attached, self.pd_capable)
        {
            Ok(()) => info!("port controller entered low power mode"),
            Err(TcpcError::Unsupported) => (),
            Err(_) => error!("failed to enter low power mode"),
        }
    }

    /// Drain all pending controller events.
    pub(crate) fn poll_tcpc(&mut self) {
        while let Some(event) = self.tcpc.poll_event() {
            self.handle_event(event);
        }
    }
}
