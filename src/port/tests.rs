//! End-to-end tests for the policy state machine, driven through the event
//! facade with a scripted controller and a manual clock.
use super::PortState;
use crate::config::PortConfig;
use crate::dummy::{DummyTcpc, FakeClock, TxBehavior};
use crate::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::message::pdo::{Capabilities, FixedSupply};
use crate::message::request::{FixedVariableRequest, RawRequest};
use crate::message::{Message, Payload};
use crate::tcpc::{CcStatus, TransmitStatus, TransmitType};
use crate::timers::{
    PD_N_CAPS_COUNT, PD_T_CC_DEBOUNCE, PD_T_PS_HARD_RESET, PD_T_SAFE_0V, PD_T_SEND_SOURCE_CAP,
    PD_T_SENDER_RESPONSE, PD_T_SRC_RECOVER, PD_T_SRC_TRANSITION,
};
use crate::{DataRole, Error, Port, PortType, PowerRole};

type TestPort = Port<DummyTcpc, FakeClock>;

fn source_config() -> PortConfig {
    PortConfig {
        port_type: PortType::Source,
        try_role: PowerRole::Sink,
        src_pdo: Capabilities::from_words(&[FixedSupply::new(5000, 3000).0]),
        snk_pdo: Capabilities::default(),
        operating_snk_mw: 0,
        self_powered: false,
    }
}

fn sink_config() -> PortConfig {
    PortConfig {
        port_type: PortType::Sink,
        try_role: PowerRole::Sink,
        src_pdo: Capabilities::default(),
        snk_pdo: Capabilities::from_words(&[
            FixedSupply::new(5000, 2000).0,
            FixedSupply::new(9000, 2000).0,
        ]),
        operating_snk_mw: 10_000,
        self_powered: false,
    }
}

fn drp_config() -> PortConfig {
    PortConfig {
        port_type: PortType::Drp,
        try_role: PowerRole::Sink,
        src_pdo: Capabilities::from_words(&[FixedSupply::new(5000, 1500).0]),
        snk_pdo: Capabilities::from_words(&[
            FixedSupply::new(5000, 2000).0,
            FixedSupply::new(9000, 2000).0,
        ]),
        operating_snk_mw: 10_000,
        self_powered: false,
    }
}

fn make_port(config: PortConfig) -> TestPort {
    Port::new(DummyTcpc::new(), FakeClock::new(), config).unwrap()
}

/// Advance the clock and fire the transition deadline if it elapsed.
fn advance(port: &mut TestPort, ms: u32) {
    port.clock().advance_ms(ms);
    port.check_delayed_work();
}

/// A control message as the partner would send it (source/DFP roles).
fn partner_control(message_type: ControlMessageType, message_id: u8) -> Message {
    Message::new(Header::new_control(
        DataRole::Dfp,
        PowerRole::Source,
        SpecificationRevision::R3_0,
        message_id,
        message_type,
    ))
}

/// A SOURCE_CAP message as the partner would send it.
fn partner_source_caps(words: &[u32], message_id: u8) -> Message {
    Message::new_with_payload(
        Header::new_data(
            DataRole::Dfp,
            PowerRole::Source,
            SpecificationRevision::R3_0,
            message_id,
            DataMessageType::SourceCapabilities,
            words.len() as u8,
        ),
        Payload::SourceCapabilities(Capabilities::from_words(words)),
    )
}

/// A REQUEST message as a sink partner would send it.
fn partner_request(rdo: RawRequest, message_id: u8, revision: SpecificationRevision) -> Message {
    Message::new_with_payload(
        Header::new_data(
            DataRole::Ufp,
            PowerRole::Sink,
            revision,
            message_id,
            DataMessageType::Request,
            1,
        ),
        Payload::Request(rdo),
    )
}

fn request_for_5v_3a() -> RawRequest {
    RawRequest(
        FixedVariableRequest(0)
            .with_object_position(1)
            .with_raw_operating_current(300)
            .with_raw_max_operating_current(300)
            .with_no_usb_suspend(true)
            .with_usb_communications_capable(true)
            .0,
    )
}

/// Bring a source port to SRC_SEND_CAPABILITIES with the partner attached
/// and VBUS up.
fn attach_as_source(port: &mut TestPort) {
    port.tcpc().cc = (CcStatus::Open, CcStatus::Rd);
    port.cc_change();
    assert_eq!(port.state, PortState::SrcAttachWait);

    advance(port, PD_T_CC_DEBOUNCE);
    assert_eq!(port.state, PortState::SrcReady);
    assert_eq!(port.prev_state, PortState::SrcAttached);
    assert!(port.attached);

    port.tcpc().vbus = true;
    port.vbus_change();
    assert_eq!(port.state, PortState::SrcSendCapabilities);
}

/// Bring a sink port to SNK_WAIT_CAPABILITIES with the partner attached and
/// VBUS up.
fn attach_as_sink(port: &mut TestPort) {
    port.tcpc().cc = (CcStatus::Rp3_0, CcStatus::Open);
    port.cc_change();
    assert_eq!(port.state, PortState::SnkAttachWait);

    advance(port, PD_T_CC_DEBOUNCE);
    assert_eq!(port.state, PortState::SnkDebounced);

    port.tcpc().vbus = true;
    port.vbus_change();
    assert_eq!(port.state, PortState::SnkWaitCapabilities);
    assert!(port.attached);
    // Implicit Type-C limit from the partner's Rp until a contract exists.
    assert_eq!(port.current(), 3000);
    assert_eq!(port.voltage(), 5000);
}

/// Negotiate the 9 V / 2 A contract of the two-PDO sink configuration.
fn negotiate_as_sink(port: &mut TestPort) {
    port.pd_receive(&partner_source_caps(
        &[FixedSupply::new(5000, 3000).0, FixedSupply::new(9000, 2000).0],
        0,
    ));
    assert_eq!(port.state, PortState::SnkNegotiateCapabilities);
    assert!(port.pd_capable);

    // The engine requested PDO#2 at 2 A.
    let (tx_type, message, _) = port.tcpc().last_transmitted();
    assert_eq!(*tx_type, TransmitType::Sop);
    let message = message.clone().unwrap();
    assert_eq!(
        message.header.message_type(),
        MessageType::Data(DataMessageType::Request)
    );
    let Some(Payload::Request(rdo)) = message.payload else {
        panic!("expected a request payload");
    };
    let request = FixedVariableRequest(rdo.0);
    assert_eq!(request.object_position(), 2);
    assert_eq!(request.operating_current_ma(), 2000);
    assert!(!request.capability_mismatch());

    port.pd_receive(&partner_control(ControlMessageType::Accept, 1));
    assert_eq!(port.state, PortState::SnkTransitionSink);

    port.pd_receive(&partner_control(ControlMessageType::PsRdy, 2));
    assert_eq!(port.state, PortState::SnkReady);
}

#[test]
fn source_attach_and_contract() {
    let mut port = make_port(source_config());
    assert_eq!(port.state, PortState::SrcUnattached);
    assert_eq!(port.tcpc().cc_req, CcStatus::Rp3_0);

    attach_as_source(&mut port);
    assert!(port.pd_capable);

    // The advertisement went out with the configured PDO.
    let (_, message, revision) = port.tcpc().last_transmitted();
    let message = message.clone().unwrap();
    assert_eq!(*revision, SpecificationRevision::R3_0);
    assert_eq!(
        message.header.message_type(),
        MessageType::Data(DataMessageType::SourceCapabilities)
    );

    // The partner requests PDO#1 at 3 A.
    port.pd_receive(&partner_request(
        request_for_5v_3a(),
        0,
        SpecificationRevision::R3_0,
    ));
    assert_eq!(port.state, PortState::SrcNegotiateCapabilities);

    // ACCEPT went out, the supply transition is pending.
    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    );

    advance(&mut port, PD_T_SRC_TRANSITION);
    assert_eq!(port.state, PortState::SrcReady);
    assert_eq!(port.prev_state, PortState::SrcTransitionSupply);
    assert!(port.explicit_contract);

    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Control(ControlMessageType::PsRdy)
    );
}

#[test]
fn sink_attach_and_negotiation() {
    let mut port = make_port(sink_config());
    assert_eq!(port.state, PortState::SnkUnattached);
    assert_eq!(port.tcpc().cc_req, CcStatus::Rd);

    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);

    assert!(port.explicit_contract);
    assert_eq!(port.voltage(), 9000);
    assert_eq!(port.current(), 2000);
}

#[test]
fn sender_response_timeout_escalates_to_hard_reset() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);

    port.pd_receive(&partner_source_caps(
        &[FixedSupply::new(5000, 3000).0, FixedSupply::new(9000, 2000).0],
        0,
    ));
    assert_eq!(port.state, PortState::SnkNegotiateCapabilities);

    // Withhold ACCEPT; the sender-response deadline escalates.
    advance(&mut port, PD_T_SENDER_RESPONSE);
    assert_eq!(port.state, PortState::SnkHardResetSinkOff);
    assert_eq!(port.hard_reset_count, 1);

    // Hard reset signaling went on the wire.
    assert!(
        port.tcpc()
            .transmitted
            .iter()
            .any(|(tx_type, _, _)| *tx_type == TransmitType::HardReset)
    );

    // VBUS never droops (captive cable adapter); the sink comes back up and
    // waits for capabilities again.
    advance(&mut port, PD_T_SAFE_0V);
    assert_eq!(port.state, PortState::SnkWaitCapabilities);
    assert_eq!(port.hard_reset_count, 1);
}

#[test]
fn rev3_to_rev2_fallback_after_reset_budget() {
    let mut port = make_port(source_config());
    attach_as_source(&mut port);

    // Two full timeout → hard-reset cycles.
    for count in 1..=2 {
        advance(&mut port, PD_T_SEND_SOURCE_CAP);
        assert_eq!(port.state, PortState::HardResetStart);
        assert_eq!(port.hard_reset_count, count);

        advance(&mut port, PD_T_PS_HARD_RESET);
        assert_eq!(port.state, PortState::SrcHardResetVbusOff);
        advance(&mut port, PD_T_SRC_RECOVER);
        assert_eq!(port.state, PortState::SrcHardResetVbusOn);

        // VBUS comes back; capabilities go out again at rev 3.0.
        port.vbus_change();
        assert_eq!(port.state, PortState::SrcSendCapabilities);
        assert_eq!(port.negotiated_rev, SpecificationRevision::R3_0);
    }

    // The third timeout spends no more hard resets; the revision drops.
    advance(&mut port, PD_T_SEND_SOURCE_CAP);
    assert_eq!(port.state, PortState::SrcSendCapabilities);
    assert_eq!(port.negotiated_rev, SpecificationRevision::R2_0);
    assert_eq!(port.hard_reset_count, 0);

    let (_, message, revision) = port.tcpc().last_transmitted();
    assert_eq!(*revision, SpecificationRevision::R2_0);
    assert_eq!(
        message.clone().unwrap().header.spec_revision().unwrap(),
        SpecificationRevision::R2_0
    );

    // A rev 2.0 sink answers and the contract completes.
    port.pd_receive(&partner_request(
        request_for_5v_3a(),
        0,
        SpecificationRevision::R2_0,
    ));
    advance(&mut port, PD_T_SRC_TRANSITION);
    assert_eq!(port.state, PortState::SrcReady);
    assert!(port.explicit_contract);
    assert_eq!(port.negotiated_rev, SpecificationRevision::R2_0);
}

#[test]
fn duplicate_message_id_is_dropped() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);
    assert_eq!(port.rx_msgid, Some(2));

    // GET_SINK_CAP with a fresh MessageID is answered...
    port.pd_receive(&partner_control(ControlMessageType::GetSinkCap, 3));
    let replies = port.tcpc().transmitted.len();
    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Data(DataMessageType::SinkCapabilities)
    );

    // ...its retry is dropped: the PHY acknowledged it, we stay silent.
    port.pd_receive(&partner_control(ControlMessageType::GetSinkCap, 3));
    assert_eq!(port.tcpc().transmitted.len(), replies);
    assert_eq!(port.state, PortState::SnkReady);
    assert_eq!(port.rx_msgid, Some(3));
}

#[test]
fn soft_reset_is_always_accepted_despite_duplicate_id() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);

    // Sync rx_msgid to 0 via a fresh exchange is not needed; deliver a
    // SOFT_RESET carrying an already-seen MessageID.
    let seen = port.rx_msgid.unwrap();
    port.pd_receive(&partner_control(ControlMessageType::SoftReset, seen));

    // Accepted regardless: IDs reset and the caps exchange restarts.
    assert_eq!(port.state, PortState::SnkWaitCapabilities);
    assert_eq!(port.message_id, 1); // ACCEPT went out after the ID reset
    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    );
}

#[test]
fn dr_swap_as_drp_flips_data_role() {
    let mut port = make_port(drp_config());
    assert_eq!(port.state, PortState::SnkUnattached);

    attach_as_sink(&mut port);

    // Dual-role partner: hold the poll pump open for its DR_SWAP.
    let dual_role_caps = [
        FixedSupply::new(5000, 3000)
            .with_dual_role_power(true)
            .with_dual_role_data(true)
            .0,
        FixedSupply::new(9000, 2000).0,
    ];
    port.pd_receive(&partner_source_caps(&dual_role_caps, 0));
    assert!(port.wait_dr_swap_message);

    port.pd_receive(&partner_control(ControlMessageType::Accept, 1));
    port.pd_receive(&partner_control(ControlMessageType::PsRdy, 2));
    assert_eq!(port.state, PortState::SnkReady);
    assert_eq!(port.data_role, DataRole::Ufp);

    port.pd_receive(&partner_control(ControlMessageType::DrSwap, 3));
    assert_eq!(port.state, PortState::SnkReady);
    assert_eq!(port.data_role, DataRole::Dfp);
    assert!(!port.wait_dr_swap_message);

    // The swap was acknowledged and the PHY told about the new role.
    assert_eq!(
        port.tcpc().roles,
        Some((true, PowerRole::Sink, DataRole::Dfp))
    );
}

#[test]
fn dr_swap_is_rejected_on_single_role_ports() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);

    port.pd_receive(&partner_control(ControlMessageType::DrSwap, 3));
    assert_eq!(port.state, PortState::SnkReady);
    assert_eq!(port.data_role, DataRole::Ufp);

    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Control(ControlMessageType::Reject)
    );
}

#[test]
fn unsupported_control_requests_get_not_supported() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);

    port.pd_receive(&partner_control(ControlMessageType::PrSwap, 3));
    assert_eq!(port.state, PortState::SnkReady);

    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Control(ControlMessageType::NotSupported)
    );
}

#[test]
fn caps_count_exhaustion_falls_back_to_non_pd_source() {
    let mut port = make_port(source_config());
    port.tcpc().tx_behavior = TxBehavior::Auto(TransmitStatus::Failed);

    attach_as_source(&mut port);
    assert!(!port.pd_capable);

    // Every send fails and retries until the caps budget is exhausted.
    for _ in 0..PD_N_CAPS_COUNT {
        advance(&mut port, PD_T_SEND_SOURCE_CAP);
    }

    assert_eq!(port.state, PortState::SrcReady);
    assert!(!port.pd_capable);
    assert!(!port.explicit_contract);
    assert_eq!(port.voltage(), 0);
    assert_eq!(port.current(), 0);
}

#[test]
fn transmit_timeout_returns_to_wait_capabilities() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);

    // The controller never reports transmit completion.
    port.tcpc().tx_behavior = TxBehavior::Stuck;
    port.pd_receive(&partner_source_caps(&[FixedSupply::new(5000, 3000).0], 0));

    // The request could not be sent; the source may try again.
    assert_eq!(port.state, PortState::SnkWaitCapabilities);
}

#[test]
fn data_role_mismatch_triggers_error_recovery() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);

    // A message claiming UFP, like ourselves: two hosts on one wire.
    let message = Message::new(Header::new_control(
        DataRole::Ufp,
        PowerRole::Source,
        SpecificationRevision::R3_0,
        0,
        ControlMessageType::Ping,
    ));
    port.pd_receive(&message);

    // Error recovery runs the port reset procedure.
    assert_eq!(port.state, PortState::PortReset);
    assert_eq!(port.tcpc().cc_req, CcStatus::Rd);
    assert!(!port.attached);
}

#[test]
fn hard_reset_signal_is_ignored_during_port_reset() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);

    // Force error recovery, then deliver a hard reset mid-procedure.
    let message = Message::new(Header::new_control(
        DataRole::Ufp,
        PowerRole::Source,
        SpecificationRevision::R3_0,
        0,
        ControlMessageType::Ping,
    ));
    port.pd_receive(&message);
    assert_eq!(port.state, PortState::PortReset);

    port.pd_hard_reset();
    assert_eq!(port.state, PortState::PortReset);
}

#[test]
fn rev1_source_caps_are_tolerated_silently() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);

    let message = Message::new_with_payload(
        Header::new_data(
            DataRole::Dfp,
            PowerRole::Source,
            SpecificationRevision::R1_0,
            0,
            DataMessageType::SourceCapabilities,
            1,
        ),
        Payload::SourceCapabilities(Capabilities::from_words(&[FixedSupply::new(5000, 3000).0])),
    );
    port.pd_receive(&message);

    // Stored, but no negotiation started.
    assert_eq!(port.state, PortState::SnkWaitCapabilities);
    assert_eq!(port.source_caps.len(), 1);
}

#[test]
fn rev1_request_is_rejected() {
    let mut port = make_port(source_config());
    attach_as_source(&mut port);

    port.pd_receive(&partner_request(
        request_for_5v_3a(),
        0,
        SpecificationRevision::R1_0,
    ));
    assert_ne!(port.state, PortState::SrcNegotiateCapabilities);

    // The queued REJECT went out (followed by a re-advertisement, since the
    // send-capabilities handler runs again after the drain).
    assert!(port.tcpc().transmitted.iter().any(|(_, message, _)| {
        message.as_ref().is_some_and(|message| {
            message.header.message_type()
                == MessageType::Control(ControlMessageType::Reject)
        })
    }));
}

#[test]
fn invalid_request_is_rejected() {
    let mut port = make_port(source_config());
    attach_as_source(&mut port);

    // 5 A of a 3 A PDO.
    let rdo = RawRequest(
        FixedVariableRequest(0)
            .with_object_position(1)
            .with_raw_operating_current(500)
            .with_raw_max_operating_current(500)
            .0,
    );
    port.pd_receive(&partner_request(rdo, 0, SpecificationRevision::R3_0));

    assert_eq!(port.state, PortState::SrcWaitNewCapabilities);
    assert!(!port.explicit_contract);

    let (_, message, _) = port.tcpc().last_transmitted();
    assert_eq!(
        message.clone().unwrap().header.message_type(),
        MessageType::Control(ControlMessageType::Reject)
    );
}

#[test]
fn hardware_toggling_is_preferred_when_available() {
    let mut tcpc = DummyTcpc::new();
    tcpc.supports_toggling = true;
    let mut port = Port::new(tcpc, FakeClock::new(), drp_config()).unwrap();

    assert_eq!(port.state, PortState::Toggling);
    assert_eq!(port.tcpc().toggling, Some((PortType::Drp, CcStatus::Rd)));

    // Partner presents Rp; toggling stops and the sink attach begins.
    port.tcpc().cc = (CcStatus::Rp1_5, CcStatus::Open);
    port.cc_change();
    assert_eq!(port.state, PortState::SnkAttachWait);
}

#[test]
fn vbus_source_and_charge_are_mutually_exclusive() {
    let mut port = make_port(drp_config());

    port.set_charge(true).unwrap();
    assert_eq!(port.set_vbus(true), Err(Error::InvalidArgument));

    port.set_charge(false).unwrap();
    port.set_vbus(true).unwrap();
    assert_eq!(port.set_charge(true), Err(Error::InvalidArgument));
}

#[test]
fn poll_settles_and_enters_low_power() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);

    port.poll();
    assert_eq!(port.tcpc().low_power, Some((true, true)));
}

#[test]
fn sink_disconnect_returns_to_unattached() {
    let mut port = make_port(sink_config());
    attach_as_sink(&mut port);
    negotiate_as_sink(&mut port);

    port.tcpc().vbus = false;
    port.vbus_change();
    assert_eq!(port.state, PortState::SnkUnattached);
    assert!(!port.attached);
    assert_eq!(port.voltage(), 0);
    assert_eq!(port.current(), 0);
}
