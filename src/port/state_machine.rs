//! The policy state machine: states, the transition engine, and the per-state
//! handlers.
use super::{Port, QueuedMessage};
use crate::message::header::{ControlMessageType, PD_MAX_REV, SpecificationRevision};
use crate::tcpc::{CcStatus, Tcpc, TransmitType};
use crate::timers::{
    Clock, PD_N_CAPS_COUNT, PD_N_HARD_RESET_COUNT, PD_T_CC_DEBOUNCE, PD_T_DB_DETECT,
    PD_T_DRP_SNK, PD_T_DRP_SRC, PD_T_ERROR_RECOVERY, PD_T_NO_RESPONSE, PD_T_PD_DEBOUNCE,
    PD_T_PS_HARD_RESET, PD_T_PS_SOURCE_OFF, PD_T_PS_SOURCE_ON, PD_T_PS_TRANSITION,
    PD_T_SAFE_0V, PD_T_SEND_SOURCE_CAP, PD_T_SENDER_RESPONSE, PD_T_SINK_WAIT_CAP,
    PD_T_SRC_RECOVER, PD_T_SRC_RECOVER_MAX, PD_T_SRC_TRANSITION, PD_T_SRC_TURN_ON,
};
use crate::{DataRole, PortType, PowerRole};

/// Port states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub(crate) enum PortState {
    Invalid,
    Toggling,

    SrcUnattached,
    SrcAttachWait,
    SrcAttached,
    SrcStartup,
    SrcSendCapabilities,
    SrcSendCapabilitiesTimeout,
    SrcNegotiateCapabilities,
    SrcTransitionSupply,
    SrcReady,
    SrcWaitNewCapabilities,

    SnkUnattached,
    SnkAttachWait,
    SnkDebounced,
    SnkAttached,
    SnkStartup,
    SnkDiscovery,
    SnkDiscoveryDebounce,
    SnkDiscoveryDebounceDone,
    SnkWaitCapabilities,
    SnkNegotiateCapabilities,
    SnkTransitionSink,
    SnkTransitionSinkVbus,
    SnkReady,

    HardResetSend,
    HardResetStart,
    SrcHardResetVbusOff,
    SrcHardResetVbusOn,
    SnkHardResetSinkOff,
    SnkHardResetWaitVbus,
    SnkHardResetSinkOn,

    SoftReset,
    SoftResetSend,

    DrSwapAccept,
    DrSwapChangeDr,

    ErrorRecovery,
    PortReset,
    PortResetWaitOff,
}

impl PortState {
    /// Conventional name of the state, as surfaced by status read-outs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invalid => "INVALID_STATE",
            Self::Toggling => "TOGGLING",
            Self::SrcUnattached => "SRC_UNATTACHED",
            Self::SrcAttachWait => "SRC_ATTACH_WAIT",
            Self::SrcAttached => "SRC_ATTACHED",
            Self::SrcStartup => "SRC_STARTUP",
            Self::SrcSendCapabilities => "SRC_SEND_CAPABILITIES",
            Self::SrcSendCapabilitiesTimeout => "SRC_SEND_CAPABILITIES_TIMEOUT",
            Self::SrcNegotiateCapabilities => "SRC_NEGOTIATE_CAPABILITIES",
            Self::SrcTransitionSupply => "SRC_TRANSITION_SUPPLY",
            Self::SrcReady => "SRC_READY",
            Self::SrcWaitNewCapabilities => "SRC_WAIT_NEW_CAPABILITIES",
            Self::SnkUnattached => "SNK_UNATTACHED",
            Self::SnkAttachWait => "SNK_ATTACH_WAIT",
            Self::SnkDebounced => "SNK_DEBOUNCED",
            Self::SnkAttached => "SNK_ATTACHED",
            Self::SnkStartup => "SNK_STARTUP",
            Self::SnkDiscovery => "SNK_DISCOVERY",
            Self::SnkDiscoveryDebounce => "SNK_DISCOVERY_DEBOUNCE",
            Self::SnkDiscoveryDebounceDone => "SNK_DISCOVERY_DEBOUNCE_DONE",
            Self::SnkWaitCapabilities => "SNK_WAIT_CAPABILITIES",
            Self::SnkNegotiateCapabilities => "SNK_NEGOTIATE_CAPABILITIES",
            Self::SnkTransitionSink => "SNK_TRANSITION_SINK",
            Self::SnkTransitionSinkVbus => "SNK_TRANSITION_SINK_VBUS",
            Self::SnkReady => "SNK_READY",
            Self::HardResetSend => "HARD_RESET_SEND",
            Self::HardResetStart => "HARD_RESET_START",
            Self::SrcHardResetVbusOff => "SRC_HARD_RESET_VBUS_OFF",
            Self::SrcHardResetVbusOn => "SRC_HARD_RESET_VBUS_ON",
            Self::SnkHardResetSinkOff => "SNK_HARD_RESET_SINK_OFF",
            Self::SnkHardResetWaitVbus => "SNK_HARD_RESET_WAIT_VBUS",
            Self::SnkHardResetSinkOn => "SNK_HARD_RESET_SINK_ON",
            Self::SoftReset => "SOFT_RESET",
            Self::SoftResetSend => "SOFT_RESET_SEND",
            Self::DrSwapAccept => "DR_SWAP_ACCEPT",
            Self::DrSwapChangeDr => "DR_SWAP_CHANGE_DR",
            Self::ErrorRecovery => "ERROR_RECOVERY",
            Self::PortReset => "PORT_RESET",
            Self::PortResetWaitOff => "PORT_RESET_WAIT_OFF",
        }
    }
}

impl<TCPC: Tcpc, CLOCK: Clock> Port<TCPC, CLOCK> {
    /// The unattached state this port starts from.
    pub(crate) fn default_state(&self) -> PortState {
        match self.port_type {
            PortType::Drp => {
                if self.try_role == PowerRole::Sink {
                    PortState::SnkUnattached
                } else {
                    PortState::SrcUnattached
                }
            }
            PortType::Sink => PortState::SnkUnattached,
            PortType::Source => PortState::SrcUnattached,
        }
    }

    pub(crate) fn ready_state(&self) -> PortState {
        if self.pwr_role == PowerRole::Source {
            PortState::SrcReady
        } else {
            PortState::SnkReady
        }
    }

    /// Escalation target after a failure: hard reset while the budget lasts,
    /// error recovery for PD-capable partners, unattached otherwise.
    pub(crate) fn hard_reset_state(&self) -> PortState {
        if self.hard_reset_count < PD_N_HARD_RESET_COUNT {
            return PortState::HardResetSend;
        }
        if self.pd_capable {
            return PortState::ErrorRecovery;
        }
        if self.pwr_role == PowerRole::Source {
            return PortState::SrcUnattached;
        }
        if self.state == PortState::SnkWaitCapabilities {
            return PortState::SnkReady;
        }
        PortState::SnkUnattached
    }

    pub(crate) fn unattached_state(&self) -> PortState {
        match self.port_type {
            PortType::Drp => {
                if self.pwr_role == PowerRole::Source {
                    PortState::SrcUnattached
                } else {
                    PortState::SnkUnattached
                }
            }
            PortType::Source => PortState::SrcUnattached,
            PortType::Sink => PortState::SnkUnattached,
        }
    }

    /// Change state, now or after `delay_ms`.
    ///
    /// An immediate change supersedes any pending delayed transition. The
    /// state machine is kicked unless it is already on the stack; in that
    /// case its loop picks the change up.
    pub(crate) fn set_state(&mut self, state: PortState, delay_ms: u32) {
        if delay_ms > 0 {
            debug!(
                "pending state change {} -> {} @ {} ms [{}]",
                self.state.name(),
                state.name(),
                delay_ms,
                self.negotiated_rev.name()
            );
            self.delayed_state = state;
            self.delay_ms = delay_ms;
            let now = self.clock.now_us();
            self.delay_timer.arm(now, delay_ms);
        } else {
            debug!("state change {} -> {}", self.state.name(), state.name());
            self.delayed_state = PortState::Invalid;
            self.delay_timer.disarm();
            self.prev_state = self.state;
            self.state = state;
            if !self.state_machine_running {
                self.state_machine();
            }
        }
    }

    /// Like [`Self::set_state`], but only if the current state is still the
    /// one whose handler is executing. Filters out decisions made stale by a
    /// reentrant event handler.
    pub(crate) fn set_state_cond(&mut self, state: PortState, delay_ms: u32) {
        if self.enter_state == self.state {
            self.set_state(state, delay_ms);
        } else {
            debug!(
                "skipped state change {} -> {} [{} ms], context state {}",
                self.state.name(),
                state.name(),
                delay_ms,
                self.enter_state.name()
            );
        }
    }

    /// Queue a single outbound response message; drained by the state
    /// machine before the next transition.
    pub(crate) fn queue_message(&mut self, message: QueuedMessage) {
        self.queued_message = message;
        if !self.state_machine_running {
            self.state_machine();
        }
    }

    /// Send the queued message without affecting state.
    fn send_queued_message(&mut self) {
        loop {
            let queued = core::mem::replace(&mut self.queued_message, QueuedMessage::None);
            match queued {
                QueuedMessage::None => break,
                QueuedMessage::CtrlWait => {
                    let _ = self.pd_send_control(ControlMessageType::Wait);
                }
                QueuedMessage::CtrlReject => {
                    let _ = self.pd_send_control(ControlMessageType::Reject);
                }
                QueuedMessage::CtrlNotSupp => {
                    let _ = self.pd_send_control(ControlMessageType::NotSupported);
                }
                QueuedMessage::DataSinkCap => {
                    let _ = self.pd_send_sink_caps();
                }
                QueuedMessage::DataSourceCap => {
                    let _ = self.pd_send_source_caps();
                }
            }
        }
    }

    /// A delayed transition whose deadline already fired (the timer is
    /// disarmed on firing, which distinguishes fired from pending).
    fn delayed_fired(&self) -> bool {
        self.delayed_state != PortState::Invalid && !self.delay_timer.is_armed()
    }

    fn delayed_pending(&self) -> bool {
        self.delayed_state != PortState::Invalid && self.delay_timer.is_armed()
    }

    /// Run the state machine until quiescent: drain the queued message,
    /// apply a fired delayed transition, then execute handlers while the
    /// state keeps changing and no delayed transition is pending.
    ///
    /// Reentrant kicks return immediately; this loop picks up whatever they
    /// changed.
    pub(crate) fn state_machine(&mut self) {
        self.state_machine_running = true;

        loop {
            if self.queued_message != QueuedMessage::None {
                self.send_queued_message();
            }

            if self.delayed_fired() {
                debug!(
                    "state change {} -> {} [delayed {} ms]",
                    self.state.name(),
                    self.delayed_state.name(),
                    self.delay_ms
                );
                self.prev_state = self.state;
                self.state = self.delayed_state;
                self.delayed_state = PortState::Invalid;
            }

            let entry = self.state;
            self.run_state_machine();

            if self.queued_message != QueuedMessage::None {
                self.send_queued_message();
            }

            // A deadline that fired while the handler ran (e.g. during a
            // transmit wait) is applied on the next pass.
            if self.delayed_fired() {
                continue;
            }

            if self.state == entry || self.delayed_pending() {
                break;
            }
        }

        self.state_machine_running = false;
    }

    /// Execute the handler for the current state once.
    fn run_state_machine(&mut self) {
        self.enter_state = self.state;

        match self.state {
            PortState::Toggling => (),

            // Source attach.
            PortState::SrcUnattached => {
                self.detach();
                let rp = self.rp_cc();
                if self.start_toggling(rp) {
                    self.set_state(PortState::Toggling, 0);
                } else {
                    self.set_cc(rp);
                    if self.port_type == PortType::Drp {
                        self.set_state(PortState::SnkUnattached, PD_T_DRP_SNK);
                    }
                }
            }
            PortState::SrcAttachWait => {
                if self.port_is_source() {
                    self.set_state(PortState::SrcAttached, PD_T_CC_DEBOUNCE);
                }
            }
            PortState::SrcAttached => {
                if let Err(err) = self.src_attach() {
                    warn!("source attach failed: {:?}", err);
                }
                // Negotiation starts once the driver reports VBUS up; see
                // the VBUS-on event path.
                self.set_state(PortState::SrcReady, 0);
            }
            PortState::SrcStartup => {
                self.caps_count = 0;
                self.negotiated_rev = PD_MAX_REV;
                self.message_id = 0;
                self.rx_msgid = None;
                self.explicit_contract = false;
                self.set_state(PortState::SrcSendCapabilities, 0);
            }
            PortState::SrcSendCapabilities => {
                self.caps_count += 1;
                if self.caps_count > PD_N_CAPS_COUNT {
                    // The partner never answered; operate without PD.
                    self.set_state(PortState::SrcReady, 0);
                } else if self.pd_send_source_caps().is_err() {
                    self.set_state(PortState::SrcSendCapabilities, PD_T_SEND_SOURCE_CAP);
                } else {
                    // The hard reset counter is cleared in SRC_READY rather
                    // than here; clearing it on every send can hang the
                    // machine against sinks that never respond.
                    self.caps_count = 0;
                    self.pd_capable = true;
                    self.set_state_cond(
                        PortState::SrcSendCapabilitiesTimeout,
                        PD_T_SEND_SOURCE_CAP,
                    );
                }
            }
            PortState::SrcSendCapabilitiesTimeout => {
                if self.hard_reset_count < PD_N_HARD_RESET_COUNT {
                    self.set_state(PortState::HardResetSend, 0);
                } else if self.negotiated_rev > SpecificationRevision::R2_0 {
                    // Some rev 2.0 sinks ignore an entire rev 3.0 SOURCE_CAP
                    // message instead of skipping the PDOs they do not
                    // understand. Once the hard-reset budget is spent, retry
                    // at the lower revision.
                    self.negotiated_rev = self.negotiated_rev.lower();
                    self.hard_reset_count = 0;
                    self.set_state(PortState::SrcSendCapabilities, 0);
                } else {
                    let next = self.hard_reset_state();
                    self.set_state(next, 0);
                }
            }
            PortState::SrcNegotiateCapabilities => {
                if self.pd_check_request().is_err() {
                    let _ = self.pd_send_control(ControlMessageType::Reject);
                    if !self.explicit_contract {
                        self.set_state(PortState::SrcWaitNewCapabilities, 0);
                    } else {
                        self.set_state(PortState::SrcReady, 0);
                    }
                } else {
                    let _ = self.pd_send_control(ControlMessageType::Accept);
                    self.set_state(PortState::SrcTransitionSupply, PD_T_SRC_TRANSITION);
                }
            }
            PortState::SrcTransitionSupply => {
                let _ = self.pd_send_control(ControlMessageType::PsRdy);
                self.explicit_contract = true;
                self.set_state_cond(PortState::SrcReady, 0);
            }
            PortState::SrcReady => {
                self.hard_reset_count = 0;
                self.typec_connect();
            }
            PortState::SrcWaitNewCapabilities => {
                // Nothing to do.
            }

            // Sink attach.
            PortState::SnkUnattached => {
                self.detach();
                if self.start_toggling(CcStatus::Rd) {
                    self.set_state(PortState::Toggling, 0);
                } else {
                    self.set_cc(CcStatus::Rd);
                    if self.port_type == PortType::Drp {
                        self.set_state(PortState::SrcUnattached, PD_T_DRP_SRC);
                    }
                }
            }
            PortState::SnkAttachWait => {
                if (self.cc1 == CcStatus::Open) != (self.cc2 == CcStatus::Open) {
                    self.set_state(PortState::SnkDebounced, PD_T_CC_DEBOUNCE);
                } else if self.port_is_disconnected() {
                    self.set_state(PortState::SnkUnattached, PD_T_CC_DEBOUNCE);
                }
            }
            PortState::SnkDebounced => {
                if self.port_is_disconnected() {
                    self.set_state(PortState::SnkUnattached, PD_T_PD_DEBOUNCE);
                } else if self.vbus_present {
                    self.set_state(PortState::SnkAttached, 0);
                } else {
                    // Wait for VBUS, but not forever.
                    self.set_state(PortState::PortReset, PD_T_PS_SOURCE_ON);
                }
            }
            PortState::SnkAttached => {
                if self.snk_attach().is_err() {
                    self.set_state(PortState::SnkUnattached, 0);
                } else {
                    self.set_state(PortState::SnkStartup, 0);
                }
            }
            PortState::SnkStartup => {
                self.negotiated_rev = PD_MAX_REV;
                self.message_id = 0;
                self.rx_msgid = None;
                self.explicit_contract = false;
                self.set_state(PortState::SnkDiscovery, 0);
            }
            PortState::SnkDiscovery => {
                if self.vbus_present {
                    let limit = self.typec_current_limit();
                    self.set_current_limit(limit, 5000);
                    if let Err(err) = self.set_charge(true) {
                        warn!("failed to enable charging: {:?}", err);
                    }
                    self.set_state(PortState::SnkWaitCapabilities, 0);
                } else {
                    // DRP ports get the dead-battery window, fixed sinks the
                    // no-response timeout.
                    let next = self.hard_reset_state();
                    self.set_state(
                        next,
                        if self.port_type == PortType::Drp {
                            PD_T_DB_DETECT
                        } else {
                            PD_T_NO_RESPONSE
                        },
                    );
                }
            }
            PortState::SnkDiscoveryDebounce => {
                self.set_state(PortState::SnkDiscoveryDebounceDone, PD_T_CC_DEBOUNCE);
            }
            PortState::SnkDiscoveryDebounceDone => {
                let next = self.unattached_state();
                self.set_state(next, 0);
            }
            PortState::SnkWaitCapabilities => {
                if self.tcpc.set_pd_rx(true).is_err() {
                    // Cannot receive PD; operate as a plain Type-C sink.
                    self.set_state(PortState::SnkReady, 0);
                } else if self.vbus_never_low {
                    // VBUS has never been low: a stable contract may predate
                    // this boot. Try a soft reset first, once.
                    self.vbus_never_low = false;
                    self.set_state(PortState::SoftResetSend, PD_T_SINK_WAIT_CAP);
                } else {
                    let next = self.hard_reset_state();
                    self.set_state(next, PD_T_SINK_WAIT_CAP);
                }
            }
            PortState::SnkNegotiateCapabilities => {
                self.pd_capable = true;
                self.hard_reset_count = 0;
                if self.pd_send_request().is_err() {
                    // Let the source send capabilities again.
                    self.set_state(PortState::SnkWaitCapabilities, 0);
                } else {
                    let next = self.hard_reset_state();
                    self.set_state_cond(next, PD_T_SENDER_RESPONSE);
                }
            }
            PortState::SnkTransitionSink | PortState::SnkTransitionSinkVbus => {
                let next = self.hard_reset_state();
                self.set_state(next, PD_T_PS_TRANSITION);
            }
            PortState::SnkReady => {
                self.typec_connect();
                // Keep the poll pump alive while a dual-role partner may
                // still initiate DR_SWAP.
                if self.wait_dr_swap_message {
                    self.poll_event_cnt = 0;
                }
            }

            // Hard reset.
            PortState::HardResetSend => {
                let _ = self.pd_transmit(TransmitType::HardReset, None);
                self.set_state(PortState::HardResetStart, 0);
                self.wait_dr_swap_message = false;
            }
            PortState::HardResetStart => {
                self.hard_reset_count += 1;
                if self.tcpc.set_pd_rx(false).is_err() {
                    error!("failed to disable PD RX");
                }
                self.sink_caps.clear();
                if self.pwr_role == PowerRole::Source {
                    self.set_state(PortState::SrcHardResetVbusOff, PD_T_PS_HARD_RESET);
                } else {
                    self.set_state(PortState::SnkHardResetSinkOff, 0);
                }
            }
            PortState::SrcHardResetVbusOff => {
                let _ = self.set_vconn(true);
                let _ = self.set_vbus(false);
                let _ = self.set_roles(self.self_powered, PowerRole::Source, DataRole::Dfp);
                self.set_state(PortState::SrcHardResetVbusOn, PD_T_SRC_RECOVER);
            }
            PortState::SrcHardResetVbusOn => {
                let _ = self.set_vconn(true);
                let _ = self.set_vbus(true);
                if self.tcpc.set_pd_rx(true).is_err() {
                    error!("failed to enable PD RX");
                }
                self.set_attached_state(true);
                // Fallback if VBUS never reports back; the VBUS-on event
                // path restarts negotiation.
                self.set_state(PortState::SrcUnattached, PD_T_PS_SOURCE_ON);
            }
            PortState::SnkHardResetSinkOff => {
                let _ = self.set_vconn(false);
                if self.pd_capable {
                    let _ = self.set_charge(false);
                }
                let _ = self.set_roles(self.self_powered, PowerRole::Sink, DataRole::Ufp);
                // VBUS may or may not toggle, depending on the adapter. If
                // it does not, move on to SNK_HARD_RESET_SINK_ON after the
                // timeout.
                self.set_state(PortState::SnkHardResetSinkOn, PD_T_SAFE_0V);
            }
            PortState::SnkHardResetWaitVbus => {
                // Assume we are disconnected if VBUS does not come back.
                self.set_state(
                    PortState::SnkUnattached,
                    PD_T_SRC_RECOVER_MAX + PD_T_SRC_TURN_ON,
                );
            }
            PortState::SnkHardResetSinkOn => {
                // There is no guarantee that VBUS is on in this state.
                if self.pd_capable {
                    let limit = self.typec_current_limit();
                    self.set_current_limit(limit, 5000);
                    let _ = self.set_charge(true);
                }
                self.set_attached_state(true);
                self.set_state(PortState::SnkStartup, 0);
            }

            // Soft reset.
            PortState::SoftReset => {
                self.message_id = 0;
                self.rx_msgid = None;
                let _ = self.pd_send_control(ControlMessageType::Accept);
                if self.pwr_role == PowerRole::Source {
                    self.set_state(PortState::SrcSendCapabilities, 0);
                } else {
                    self.set_state(PortState::SnkWaitCapabilities, 0);
                }
            }
            PortState::SoftResetSend => {
                self.message_id = 0;
                self.rx_msgid = None;
                if self.pd_send_control(ControlMessageType::SoftReset).is_err() {
                    let next = self.hard_reset_state();
                    self.set_state_cond(next, 0);
                } else {
                    let next = self.hard_reset_state();
                    self.set_state_cond(next, PD_T_SENDER_RESPONSE);
                }
            }

            // Data role swap.
            PortState::DrSwapAccept => {
                let _ = self.pd_send_control(ControlMessageType::Accept);
                self.set_state_cond(PortState::DrSwapChangeDr, 0);
            }
            PortState::DrSwapChangeDr => {
                let data_role = if self.data_role == DataRole::Dfp {
                    DataRole::Ufp
                } else {
                    DataRole::Dfp
                };
                if let Err(err) = self.set_roles(true, self.pwr_role, data_role) {
                    error!("failed to change data role: {:?}", err);
                }
                self.wait_dr_swap_message = false;
                let next = self.ready_state();
                self.set_state(next, 0);
            }

            // Recovery.
            PortState::ErrorRecovery => {
                warn!("error recovery, coming from {}", self.prev_state.name());
                self.set_state(PortState::PortReset, 0);
            }
            PortState::PortReset => {
                self.reset_port();
                if self.self_powered {
                    self.set_cc(CcStatus::Open);
                } else {
                    let cc = if self.default_state() == PortState::SnkUnattached {
                        CcStatus::Rd
                    } else {
                        self.rp_cc()
                    };
                    self.set_cc(cc);
                }
                self.set_state(PortState::PortResetWaitOff, PD_T_ERROR_RECOVERY);
            }
            PortState::PortResetWaitOff => {
                let next = self.default_state();
                self.set_state(
                    next,
                    if self.vbus_present {
                        PD_T_PS_SOURCE_OFF
                    } else {
                        0
                    },
                );
            }

            PortState::Invalid => {
                error!("unexpected port state");
            }
        }
    }
}
