//! Event facade: the entry points raised by the port controller, and the
//! inbound message dispatch.
//!
//! Each entry clears the poll-inactivity counter, so activity keeps the
//! [`Port::poll`] pump alive.
use super::state_machine::PortState;
use super::{Port, QueuedMessage};
use crate::message::header::{
    ControlMessageType, DataMessageType, MessageType, PD_MAX_REV, SpecificationRevision,
};
use crate::message::{Message, Payload};
use crate::tcpc::{CcStatus, Event, Tcpc, TransmitStatus};
use crate::timers::{Clock, PD_N_HARD_RESET_COUNT};
use crate::{DataRole, PortType, PowerRole};

impl<TCPC: Tcpc, CLOCK: Clock> Port<TCPC, CLOCK> {
    /// Route one driver event into the port.
    pub(crate) fn handle_event(&mut self, event: Event) {
        match event {
            Event::CcChange => self.cc_change(),
            Event::VbusChange => self.vbus_change(),
            Event::PdMessage(message) => self.pd_receive(&message),
            Event::HardReset => self.pd_hard_reset(),
            Event::TxComplete(status) => self.pd_transmit_complete(status),
        }
    }

    /// A CC line changed; re-sample both lines and route by state.
    pub fn cc_change(&mut self) {
        self.poll_event_cnt = 0;
        if let Ok((cc1, cc2)) = self.tcpc.get_cc() {
            self.handle_cc_change(cc1, cc2);
        }
    }

    pub(crate) fn handle_cc_change(&mut self, cc1: CcStatus, cc2: CcStatus) {
        let old_cc1 = self.cc1;
        let old_cc2 = self.cc2;
        self.cc1 = cc1;
        self.cc2 = cc2;

        debug!(
            "CC1: {:?} -> {:?}, CC2: {:?} -> {:?} [state {}, {}]",
            old_cc1,
            cc1,
            old_cc2,
            cc2,
            self.state.name(),
            if self.port_is_disconnected() {
                "disconnected"
            } else {
                "connected"
            }
        );

        match self.state {
            PortState::Toggling => {
                if self.port_is_source() {
                    self.set_state(PortState::SrcAttachWait, 0);
                } else if self.port_is_sink() {
                    self.set_state(PortState::SnkAttachWait, 0);
                }
            }
            PortState::SrcUnattached | PortState::SrcAttachWait => {
                if self.port_is_disconnected() {
                    self.set_state(PortState::SrcUnattached, 0);
                } else if cc1 != old_cc1 || cc2 != old_cc2 {
                    self.set_state(PortState::SrcAttachWait, 0);
                }
            }
            PortState::SrcAttached | PortState::SrcSendCapabilities | PortState::SrcReady => {
                if self.port_is_disconnected() || !self.port_is_source() {
                    self.set_state(PortState::SrcUnattached, 0);
                }
            }
            PortState::SnkUnattached => {
                if self.port_is_sink() {
                    self.set_state(PortState::SnkAttachWait, 0);
                }
            }
            PortState::SnkAttachWait => {
                let new_state = if (self.cc1 == CcStatus::Open) != (self.cc2 == CcStatus::Open) {
                    PortState::SnkDebounced
                } else if self.port_is_disconnected() {
                    PortState::SnkUnattached
                } else {
                    return;
                };
                // The line is still moving; restart the debounce.
                if new_state != self.delayed_state {
                    self.set_state(PortState::SnkAttachWait, 0);
                }
            }
            PortState::SnkDebounced => {
                let new_state = if self.port_is_disconnected() {
                    PortState::SnkUnattached
                } else if self.vbus_present {
                    if self.try_src() {
                        PortState::Invalid
                    } else {
                        PortState::SnkAttached
                    }
                } else {
                    PortState::SnkUnattached
                };
                if new_state != self.delayed_state {
                    self.set_state(PortState::SnkDebounced, 0);
                }
            }
            PortState::SnkReady => {
                if self.port_is_disconnected() {
                    let next = self.unattached_state();
                    self.set_state(next, 0);
                } else if !self.pd_capable && (cc1 != old_cc1 || cc2 != old_cc2) {
                    // Non-PD partner changed its Rp advertisement.
                    let limit = self.typec_current_limit();
                    self.set_current_limit(limit, 5000);
                }
            }
            PortState::SnkDiscovery => {
                // CC line is unstable, wait for debounce.
                if self.port_is_disconnected() {
                    self.set_state(PortState::SnkDiscoveryDebounce, 0);
                }
            }
            PortState::SnkDiscoveryDebounce => (),
            PortState::PortReset | PortState::PortResetWaitOff => {
                // State returns to default once the timer completes; ignore
                // CC changes here.
            }
            _ => {
                if self.port_is_disconnected() {
                    let next = self.unattached_state();
                    self.set_state(next, 0);
                }
            }
        }
    }

    /// VBUS crossed a detection threshold; re-sample and route by state.
    pub fn vbus_change(&mut self) {
        self.poll_event_cnt = 0;
        if self.tcpc.get_vbus() {
            self.handle_vbus_on();
        } else {
            self.handle_vbus_off();
        }
    }

    fn handle_vbus_on(&mut self) {
        debug!("VBUS on event");
        self.vbus_present = true;
        // Above vSafe5V implies not at vSafe0V.
        self.vbus_vsafe0v = false;

        match self.state {
            PortState::SnkTransitionSinkVbus => {
                self.explicit_contract = true;
                self.set_state(PortState::SnkReady, 0);
            }
            PortState::SnkDiscovery => {
                // Re-run discovery, now with VBUS present.
                self.set_state(PortState::SnkDiscovery, 0);
            }
            PortState::SnkDebounced => {
                self.set_state(PortState::SnkAttached, 0);
            }
            PortState::SnkHardResetWaitVbus => {
                self.set_state(PortState::SnkHardResetSinkOn, 0);
            }
            PortState::SrcAttached => {
                self.set_state(PortState::SrcStartup, 0);
            }
            PortState::SrcHardResetVbusOn => {
                self.set_state(PortState::SrcStartup, 0);
            }
            PortState::SrcReady => {
                // The attach path lands in SRC_READY before the driver
                // reports VBUS; start negotiation on the edge, but leave an
                // established PD link alone.
                if !self.pd_capable {
                    self.set_state(PortState::SrcStartup, 0);
                }
            }
            PortState::PortReset | PortState::PortResetWaitOff => {
                // State returns to default once the timer completes; ignore
                // VBUS changes here.
            }
            _ => (),
        }
    }

    fn handle_vbus_off(&mut self) {
        debug!("VBUS off event [vsafe0v = {}]", self.vbus_vsafe0v);
        self.vbus_present = false;
        self.vbus_never_low = false;

        match self.state {
            PortState::SnkHardResetSinkOff => {
                self.set_state(PortState::SnkHardResetWaitVbus, 0);
            }
            PortState::HardResetSend => (),
            PortState::SnkAttachWait => {
                self.set_state(PortState::SnkUnattached, 0);
            }
            PortState::SnkNegotiateCapabilities => (),
            PortState::PortResetWaitOff => {
                let next = self.default_state();
                self.set_state(next, 0);
            }
            PortState::PortReset => {
                // State returns to default once the timer completes; ignore
                // VBUS changes here.
            }
            _ => {
                if self.pwr_role == PowerRole::Sink && self.attached {
                    self.set_state(PortState::SnkUnattached, 0);
                }
            }
        }
    }

    /// Hard Reset signaling was received from the partner.
    pub fn pd_hard_reset(&mut self) {
        debug!("received hard reset");
        self.poll_event_cnt = 0;

        // A hard reset during the port reset procedure is ignored, so the
        // recovery can complete.
        if matches!(
            self.state,
            PortState::PortReset | PortState::PortResetWaitOff
        ) {
            return;
        }

        // Repeated hard resets mean executing them is not working; revert to
        // error recovery.
        let next = if self.hard_reset_count < PD_N_HARD_RESET_COUNT {
            PortState::HardResetStart
        } else {
            PortState::ErrorRecovery
        };
        self.set_state(next, 0);
    }

    /// A transmission completed on the wire.
    pub fn pd_transmit_complete(&mut self, status: TransmitStatus) {
        debug!("PD TX complete, status: {:?}", status);
        self.poll_event_cnt = 0;
        self.tx_status = status;
        self.tx_complete = true;
    }

    /// A PD message arrived (already acknowledged by the PHY).
    pub fn pd_receive(&mut self, message: &Message) {
        self.poll_event_cnt = 0;

        debug!(
            "PD RX, header: {:#x} [attached {}]",
            message.header.0, self.attached
        );

        if !self.attached {
            return;
        }

        // Drop retries of a message we already accepted; the PHY GoodCRC'd
        // the retry. Soft reset always carries MessageID zero and is always
        // accepted.
        let msgid = message.header.message_id();
        let is_soft_reset = matches!(
            message.header.message_type(),
            MessageType::Control(ControlMessageType::SoftReset)
        );
        if self.rx_msgid == Some(msgid) && !is_soft_reset {
            return;
        }
        self.rx_msgid = Some(msgid);

        // If both ends believe to be DFP/host, we have a data role mismatch.
        let remote_is_host = message.header.port_data_role() == DataRole::Dfp;
        let local_is_host = self.data_role == DataRole::Dfp;
        if remote_is_host == local_is_host {
            error!("data role mismatch, initiating error recovery");
            self.set_state(PortState::ErrorRecovery, 0);
            return;
        }

        if message.header.extended() {
            // Extended messages are not implemented.
            self.queue_message(QueuedMessage::CtrlNotSupp);
        } else if message.header.num_objects() > 0 {
            self.pd_data_request(message);
        } else {
            self.pd_ctrl_request(message);
        }
    }

    fn pd_data_request(&mut self, message: &Message) {
        let MessageType::Data(message_type) = message.header.message_type() else {
            return;
        };
        let Ok(rev) = message.header.spec_revision() else {
            return;
        };

        match message_type {
            DataMessageType::SourceCapabilities => {
                let Some(Payload::SourceCapabilities(caps)) = &message.payload else {
                    return;
                };
                self.source_caps = caps.clone();

                if let Err(err) = self.source_caps.validate() {
                    warn!("partner source capabilities are malformed: {:?}", err);
                }

                // Rev 1.0 sources are tolerated silently; we do not
                // negotiate with them.
                if rev == SpecificationRevision::R1_0 {
                    return;
                }

                // Adopt the partner's revision for subsequent messages.
                if rev < PD_MAX_REV {
                    self.negotiated_rev = rev;
                }

                // A partner capable of both dual-role power and data is a
                // self-powered Type-C device; hold the poll pump open for
                // the DR_SWAP it may initiate.
                self.wait_dr_swap_message =
                    self.source_caps.dual_role_power() && self.source_caps.dual_role_data();

                // This may arrive while VBUS is not present, e.g. shortly
                // after PS_RDY of a power swap. Accept it either way and
                // keep waiting for VBUS afterwards.
                self.set_state(PortState::SnkNegotiateCapabilities, 0);
            }
            DataMessageType::Request => {
                // Rev 1.0 requesters are rejected.
                if rev == SpecificationRevision::R1_0 {
                    self.queue_message(QueuedMessage::CtrlReject);
                    return;
                }

                if rev < PD_MAX_REV {
                    self.negotiated_rev = rev;
                }

                let Some(Payload::Request(rdo)) = &message.payload else {
                    return;
                };
                self.sink_request = *rdo;
                self.set_state(PortState::SrcNegotiateCapabilities, 0);
            }
            DataMessageType::SinkCapabilities => {
                // Stored for status read-outs; nothing acts on them yet.
                let Some(Payload::SinkCapabilities(caps)) = &message.payload else {
                    return;
                };
                self.sink_caps = caps.clone();
            }
            _ => (),
        }
    }

    fn pd_ctrl_request(&mut self, message: &Message) {
        let MessageType::Control(message_type) = message.header.message_type() else {
            return;
        };

        match message_type {
            ControlMessageType::GoodCrc | ControlMessageType::Ping => (),
            ControlMessageType::GetSourceCap => {
                match self.state {
                    PortState::SrcReady | PortState::SnkReady => {
                        self.queue_message(QueuedMessage::DataSourceCap)
                    }
                    _ => self.queue_message(QueuedMessage::CtrlReject),
                };
            }
            ControlMessageType::GetSinkCap => {
                match self.state {
                    PortState::SrcReady | PortState::SnkReady => {
                        self.queue_message(QueuedMessage::DataSinkCap)
                    }
                    _ => self.queue_message(QueuedMessage::CtrlReject),
                };
            }
            ControlMessageType::GotoMin => (),
            ControlMessageType::PsRdy => {
                if self.state == PortState::SnkTransitionSink {
                    if self.vbus_present {
                        self.set_current_limit(self.req_current_limit, self.req_supply_voltage);
                        self.explicit_contract = true;
                        self.set_state(PortState::SnkReady, 0);
                    } else {
                        // Seen after a power swap. Keep waiting for VBUS in
                        // a transitional state.
                        self.set_state(PortState::SnkTransitionSinkVbus, 0);
                    }
                }
            }
            ControlMessageType::Reject
            | ControlMessageType::Wait
            | ControlMessageType::NotSupported => {
                if self.state == PortState::SnkNegotiateCapabilities {
                    let next = if self.explicit_contract {
                        PortState::SnkReady
                    } else {
                        PortState::SnkWaitCapabilities
                    };
                    self.set_state(next, 0);
                }
            }
            ControlMessageType::Accept => match self.state {
                PortState::SnkNegotiateCapabilities => {
                    self.set_state(PortState::SnkTransitionSink, 0);
                }
                PortState::SoftResetSend => {
                    self.message_id = 0;
                    self.rx_msgid = None;
                    let next = if self.pwr_role == PowerRole::Source {
                        PortState::SrcSendCapabilities
                    } else {
                        PortState::SnkWaitCapabilities
                    };
                    self.set_state(next, 0);
                }
                _ => (),
            },
            ControlMessageType::SoftReset => {
                self.set_state(PortState::SoftReset, 0);
            }
            ControlMessageType::DrSwap => {
                if self.port_type != PortType::Drp {
                    self.queue_message(QueuedMessage::CtrlReject);
                    return;
                }
                match self.state {
                    PortState::SrcReady | PortState::SnkReady => {
                        self.set_state(PortState::DrSwapAccept, 0);
                    }
                    _ => self.queue_message(QueuedMessage::CtrlWait),
                }
            }
            ControlMessageType::PrSwap
            | ControlMessageType::VconnSwap
            | ControlMessageType::GetSourceCapExtended
            | ControlMessageType::GetStatus
            | ControlMessageType::FrSwap
            | ControlMessageType::GetPpsStatus
            | ControlMessageType::GetCountryCodes => {
                warn!("unsupported control message {:?}", message_type);
                self.queue_message(QueuedMessage::CtrlNotSupp);
            }
            ControlMessageType::Reserved => {
                error!("unrecognized control message");
            }
        }
    }
}
