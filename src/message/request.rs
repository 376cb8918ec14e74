//! Request data objects: selection of a source PDO against local sink
//! capabilities, request construction, and the inverse check a source runs
//! on an inbound request.
use proc_bitfield::bitfield;

use crate::message::pdo::{Capabilities, PowerDataObject};

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// Type-independent view of an RDO.
    pub struct RawRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Index of the requested source PDO, 1-based.
        pub object_position: u8 @ 28..=31,
        /// GiveBack supported.
        pub giveback_flag: bool @ 27,
        /// The offer does not satisfy the sink's operating requirement.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// No USB suspend.
        pub no_usb_suspend: bool @ 24,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// RDO against a fixed or variable supply PDO.
    pub struct FixedVariableRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Index of the requested source PDO, 1-based.
        pub object_position: u8 @ 28..=31,
        /// GiveBack supported.
        pub giveback_flag: bool @ 27,
        /// The offer does not satisfy the sink's operating requirement.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// No USB suspend.
        pub no_usb_suspend: bool @ 24,
        /// Operating current in 10 mA units.
        pub raw_operating_current: u16 @ 10..=19,
        /// Maximum operating current in 10 mA units.
        pub raw_max_operating_current: u16 @ 0..=9,
    }
}

impl FixedVariableRequest {
    /// Operating current in mA.
    pub fn operating_current_ma(&self) -> u32 {
        u32::from(self.raw_operating_current()) * 10
    }

    /// Maximum operating current in mA.
    pub fn max_operating_current_ma(&self) -> u32 {
        u32::from(self.raw_max_operating_current()) * 10
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// RDO against a battery supply PDO.
    pub struct BatteryRequest(pub u32): Debug, FromStorage, IntoStorage {
        /// Index of the requested source PDO, 1-based.
        pub object_position: u8 @ 28..=31,
        /// GiveBack supported.
        pub giveback_flag: bool @ 27,
        /// The offer does not satisfy the sink's operating requirement.
        pub capability_mismatch: bool @ 26,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 25,
        /// No USB suspend.
        pub no_usb_suspend: bool @ 24,
        /// Operating power in 250 mW units.
        pub raw_operating_power: u16 @ 10..=19,
        /// Maximum operating power in 250 mW units.
        pub raw_max_operating_power: u16 @ 0..=9,
    }
}

impl BatteryRequest {
    /// Operating power in mW.
    pub fn operating_power_mw(&self) -> u32 {
        u32::from(self.raw_operating_power()) * 250
    }

    /// Maximum operating power in mW.
    pub fn max_operating_power_mw(&self) -> u32 {
        u32::from(self.raw_max_operating_power()) * 250
    }
}

/// Errors from request selection and validation.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestError {
    /// No source PDO matches the local sink capabilities.
    #[error("no matching source capability")]
    NoMatch,
    /// The request does not fit the referenced source PDO.
    #[error("invalid request")]
    Invalid,
}

/// A request built against the partner's source capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BuiltRequest {
    /// The RDO to transmit.
    pub rdo: RawRequest,
    /// Current that will be drawn once the contract is in place (mA).
    pub current_limit_ma: u32,
    /// Supply voltage of the requested PDO (mV).
    pub supply_voltage_mv: u32,
}

/// Voltage span of a PDO for matching purposes; augmented PDOs are skipped.
fn voltage_span_mv(pdo: &PowerDataObject) -> Option<(u32, u32)> {
    match pdo {
        PowerDataObject::Fixed(fixed) => Some((fixed.voltage_mv(), fixed.voltage_mv())),
        PowerDataObject::Battery(batt) => Some((batt.min_voltage_mv(), batt.max_voltage_mv())),
        PowerDataObject::Variable(var) => Some((var.min_voltage_mv(), var.max_voltage_mv())),
        PowerDataObject::Augmented(_) => None,
    }
}

fn max_current_ma(pdo: &PowerDataObject) -> u32 {
    match pdo {
        PowerDataObject::Fixed(fixed) => fixed.max_current_ma(),
        PowerDataObject::Variable(var) => var.max_current_ma(),
        _ => 0,
    }
}

fn max_power_mw(pdo: &PowerDataObject) -> u32 {
    match pdo {
        PowerDataObject::Battery(batt) => batt.max_power_mw(),
        _ => 0,
    }
}

/// Advertised power of a source PDO at its minimum voltage, in mW.
fn source_power_mw(pdo: &PowerDataObject, min_mv: u32) -> u32 {
    match pdo {
        PowerDataObject::Fixed(_) | PowerDataObject::Variable(_) => {
            max_current_ma(pdo) * min_mv / 1000
        }
        PowerDataObject::Battery(batt) => batt.max_power_mw(),
        PowerDataObject::Augmented(_) => 0,
    }
}

/// Select the source PDO providing the most power that has a matching sink
/// capability. Ties are broken in favor of the higher source voltage.
///
/// Returns `(source index, sink index)`.
pub fn select_pdo(source: &Capabilities, sink: &Capabilities) -> Option<(usize, usize)> {
    let mut selected = None;
    let mut best_mw = 0;
    let mut best_mv = 0;

    for (src_index, src_pdo) in source.pdos().iter().enumerate() {
        let Some((min_src_mv, max_src_mv)) = voltage_span_mv(src_pdo) else {
            continue;
        };
        let src_mw = source_power_mw(src_pdo, min_src_mv);

        for (snk_index, snk_pdo) in sink.pdos().iter().enumerate() {
            let Some((min_snk_mv, max_snk_mv)) = voltage_span_mv(snk_pdo) else {
                continue;
            };

            if max_src_mv <= max_snk_mv && min_src_mv >= min_snk_mv {
                // Prefer higher voltages if available.
                if (src_mw == best_mw && min_src_mv > best_mv) || src_mw > best_mw {
                    selected = Some((src_index, snk_index));
                    best_mw = src_mw;
                    best_mv = min_src_mv;
                }
            }
        }
    }

    selected
}

/// Build a request against `source`, drawing as much power as the matching
/// local sink PDO allows.
///
/// When the offered power falls short of `operating_snk_mw`, the capability
/// mismatch flag is set and the maximum field is raised to the sink's
/// advertised maximum.
pub fn build_request(
    source: &Capabilities,
    sink: &Capabilities,
    operating_snk_mw: u32,
) -> Result<BuiltRequest, RequestError> {
    let (src_index, snk_index) = select_pdo(source, sink).ok_or(RequestError::NoMatch)?;

    let src_pdo = &source.pdos()[src_index];
    let snk_pdo = &sink.pdos()[snk_index];

    let mv = match voltage_span_mv(src_pdo) {
        Some((min_mv, _)) => min_mv,
        None => return Err(RequestError::NoMatch),
    };

    let object_position = (src_index + 1) as u8;
    let is_battery = matches!(src_pdo, PowerDataObject::Battery(_));

    // Select the maximum available current (or power) within the matching
    // sink PDO's limit.
    let (ma, mw) = if is_battery {
        let mw = max_power_mw(src_pdo).min(max_power_mw(snk_pdo));
        (1000 * mw / mv, mw)
    } else {
        let ma = max_current_ma(src_pdo).min(max_current_ma(snk_pdo));
        (ma, ma * mv / 1000)
    };

    // Flag a mismatch if the offered power is less than the operating power,
    // and raise the maximum to what the sink could use.
    let mismatch = mw < operating_snk_mw;
    let mut max_ma = ma;
    let mut max_mw = mw;
    if mismatch {
        if is_battery && max_power_mw(snk_pdo) > max_power_mw(src_pdo) {
            max_mw = max_power_mw(snk_pdo);
        } else if max_current_ma(snk_pdo) > max_current_ma(src_pdo) {
            max_ma = max_current_ma(snk_pdo);
        }
    }

    let rdo = if is_battery {
        debug!(
            "requesting PDO {}: {} mV, {} mW{}",
            object_position,
            mv,
            mw,
            if mismatch { " [mismatch]" } else { "" }
        );

        BatteryRequest(0)
            .with_object_position(object_position)
            .with_raw_operating_power((mw / 250) as u16)
            .with_raw_max_operating_power((max_mw / 250) as u16)
            .with_capability_mismatch(mismatch)
            .with_usb_communications_capable(true)
            .with_no_usb_suspend(true)
            .0
    } else {
        debug!(
            "requesting PDO {}: {} mV, {} mA{}",
            object_position,
            mv,
            ma,
            if mismatch { " [mismatch]" } else { "" }
        );

        FixedVariableRequest(0)
            .with_object_position(object_position)
            .with_raw_operating_current((ma / 10) as u16)
            .with_raw_max_operating_current((max_ma / 10) as u16)
            .with_capability_mismatch(mismatch)
            .with_usb_communications_capable(true)
            .with_no_usb_suspend(true)
            .0
    };

    Ok(BuiltRequest {
        rdo: RawRequest(rdo),
        current_limit_ma: ma,
        supply_voltage_mv: mv,
    })
}

/// Validate an inbound request against the local source capabilities.
pub fn check_request(rdo: RawRequest, source: &Capabilities) -> Result<(), RequestError> {
    let index = rdo.object_position() as usize;
    if index == 0 || index > source.len() {
        return Err(RequestError::Invalid);
    }

    let pdo = &source.pdos()[index - 1];
    match pdo {
        PowerDataObject::Fixed(_) | PowerDataObject::Variable(_) => {
            let request = FixedVariableRequest(rdo.0);
            let op = request.operating_current_ma();
            let max = request.max_operating_current_ma();
            let pdo_max = max_current_ma(pdo);

            if op > pdo_max {
                return Err(RequestError::Invalid);
            }
            if max > pdo_max && !request.capability_mismatch() {
                return Err(RequestError::Invalid);
            }

            debug!(
                "requested {} mA of {} mA available",
                op, pdo_max
            );
        }
        PowerDataObject::Battery(_) => {
            let request = BatteryRequest(rdo.0);
            let op = request.operating_power_mw();
            let max = request.max_operating_power_mw();
            let pdo_max = max_power_mw(pdo);

            if op > pdo_max {
                return Err(RequestError::Invalid);
            }
            if max > pdo_max && !request.capability_mismatch() {
                return Err(RequestError::Invalid);
            }

            debug!(
                "requested {} mW of {} mW available",
                op, pdo_max
            );
        }
        PowerDataObject::Augmented(_) => return Err(RequestError::Invalid),
    }

    Ok(())
}
