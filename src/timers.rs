//! Time base, the single-shot transition deadline, and the USB-PD timing
//! constants.

/// Monotonic time source and busy-wait primitive, implemented by the user
/// application.
pub trait Clock {
    /// Current monotonic time in microseconds.
    fn now_us(&self) -> u64;

    /// Busy-wait for the given number of microseconds.
    fn delay_us(&mut self, us: u32);
}

/// tCCDebounce (ms).
pub const PD_T_CC_DEBOUNCE: u32 = 200;
/// tPDDebounce (ms).
pub const PD_T_PD_DEBOUNCE: u32 = 20;
/// tTypeCSendSourceCap (ms).
pub const PD_T_SEND_SOURCE_CAP: u32 = 150;
/// tSenderResponse (ms).
pub const PD_T_SENDER_RESPONSE: u32 = 60;
/// tTypeCSinkWaitCap (ms).
pub const PD_T_SINK_WAIT_CAP: u32 = 310;
/// tPSTransition (ms).
pub const PD_T_PS_TRANSITION: u32 = 500;
/// tSrcTransition (ms).
pub const PD_T_SRC_TRANSITION: u32 = 35;
/// tDRP fraction spent presenting Rd (ms).
pub const PD_T_DRP_SNK: u32 = 40;
/// tDRP fraction spent presenting Rp (ms).
pub const PD_T_DRP_SRC: u32 = 30;
/// tPSHardReset (ms).
pub const PD_T_PS_HARD_RESET: u32 = 30;
/// tSrcRecover (ms).
pub const PD_T_SRC_RECOVER: u32 = 760;
/// tSrcRecover, upper bound (ms).
pub const PD_T_SRC_RECOVER_MAX: u32 = 1000;
/// tSrcTurnOn (ms).
pub const PD_T_SRC_TURN_ON: u32 = 275;
/// tSafe0V (ms).
pub const PD_T_SAFE_0V: u32 = 650;
/// tPSSourceOff (ms).
pub const PD_T_PS_SOURCE_OFF: u32 = 920;
/// tPSSourceOn (ms).
pub const PD_T_PS_SOURCE_ON: u32 = 480;
/// tErrorRecovery (ms).
pub const PD_T_ERROR_RECOVERY: u32 = 100;
/// Dead-battery detection window for DRP sinks (ms).
pub const PD_T_DB_DETECT: u32 = 10_000;
/// tNoResponse (ms).
pub const PD_T_NO_RESPONSE: u32 = 5_000;
/// Budget for the port controller to complete one transmission (ms).
pub const PD_T_TCPC_TX_TIMEOUT: u32 = 100;

/// nCapsCount: attempts to send source capabilities before operating
/// without PD.
pub const PD_N_CAPS_COUNT: u32 = 50;
/// nHardResetCount: hard resets before escalating to error recovery.
pub const PD_N_HARD_RESET_COUNT: u32 = 2;

/// The one pending transition deadline of the state machine.
///
/// At most one delayed transition exists at a time; a target of zero means
/// disarmed.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Deadline {
    target_us: u64,
}

impl Deadline {
    /// Arm for `ms` milliseconds from `now_us`.
    pub fn arm(&mut self, now_us: u64, ms: u32) {
        self.target_us = now_us + u64::from(ms) * 1000;
    }

    pub fn disarm(&mut self) {
        self.target_us = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.target_us != 0
    }

    /// Whether the deadline is armed and has elapsed.
    pub fn fired(&self, now_us: u64) -> bool {
        self.target_us != 0 && now_us >= self.target_us
    }
}

#[cfg(test)]
mod tests {
    use super::Deadline;

    #[test]
    fn deadline_arm_and_fire() {
        let mut deadline = Deadline::default();
        assert!(!deadline.is_armed());
        assert!(!deadline.fired(1_000_000));

        deadline.arm(1_000, 35);
        assert!(deadline.is_armed());
        assert!(!deadline.fired(1_000));
        assert!(!deadline.fired(35_999));
        assert!(deadline.fired(36_000));

        deadline.disarm();
        assert!(!deadline.is_armed());
        assert!(!deadline.fired(u64::MAX));
    }
}
