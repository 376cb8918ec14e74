//! Power data objects and the capability-list validator.
//!
//! PDOs are stored as their raw 32-bit wire words; the scaled accessors
//! return integer milli-units, the same units the wire encodes.
use heapless::Vec;
use proc_bitfield::bitfield;

/// Maximum number of data objects in a capabilities message.
pub const PDO_MAX_OBJECTS: usize = 7;

/// The four PDO flavors, in the order the specification requires them to be
/// listed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PdoKind {
    /// Fixed supply.
    Fixed,
    /// Battery supply.
    Battery,
    /// Variable supply (non-battery).
    Variable,
    /// Augmented PDO (programmable supplies).
    Augmented,
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// A fixed supply PDO.
    pub struct FixedSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// PDO type bits.
        pub kind: u8 @ 30..=31,
        /// Dual-role power.
        pub dual_role_power: bool @ 29,
        /// USB suspend supported.
        pub usb_suspend_supported: bool @ 28,
        /// Unconstrained power.
        pub unconstrained_power: bool @ 27,
        /// USB communications capable.
        pub usb_communications_capable: bool @ 26,
        /// Dual-role data.
        pub dual_role_data: bool @ 25,
        /// Peak current.
        pub peak_current: u8 @ 20..=21,
        /// Voltage in 50 mV units.
        pub raw_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units.
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl FixedSupply {
    /// A fixed supply at `voltage_mv`, delivering up to `max_current_ma`.
    pub fn new(voltage_mv: u32, max_current_ma: u32) -> Self {
        Self(0)
            .with_raw_voltage((voltage_mv / 50) as u16)
            .with_raw_max_current((max_current_ma / 10) as u16)
    }

    /// Supply voltage in mV.
    pub fn voltage_mv(&self) -> u32 {
        u32::from(self.raw_voltage()) * 50
    }

    /// Maximum current in mA.
    pub fn max_current_ma(&self) -> u32 {
        u32::from(self.raw_max_current()) * 10
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// A battery supply PDO.
    pub struct Battery(pub u32): Debug, FromStorage, IntoStorage {
        /// PDO type bits.
        pub kind: u8 @ 30..=31,
        /// Maximum voltage in 50 mV units.
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum voltage in 50 mV units.
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum allowable power in 250 mW units.
        pub raw_max_power: u16 @ 0..=9,
    }
}

impl Battery {
    /// A battery supply spanning `min_voltage_mv..=max_voltage_mv` at up to
    /// `max_power_mw`.
    pub fn new(min_voltage_mv: u32, max_voltage_mv: u32, max_power_mw: u32) -> Self {
        Self(0)
            .with_kind(PdoKind::Battery as u8)
            .with_raw_min_voltage((min_voltage_mv / 50) as u16)
            .with_raw_max_voltage((max_voltage_mv / 50) as u16)
            .with_raw_max_power((max_power_mw / 250) as u16)
    }

    /// Maximum voltage in mV.
    pub fn max_voltage_mv(&self) -> u32 {
        u32::from(self.raw_max_voltage()) * 50
    }

    /// Minimum voltage in mV.
    pub fn min_voltage_mv(&self) -> u32 {
        u32::from(self.raw_min_voltage()) * 50
    }

    /// Maximum power in mW.
    pub fn max_power_mw(&self) -> u32 {
        u32::from(self.raw_max_power()) * 250
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// A variable (non-battery) supply PDO.
    pub struct VariableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// PDO type bits.
        pub kind: u8 @ 30..=31,
        /// Maximum voltage in 50 mV units.
        pub raw_max_voltage: u16 @ 20..=29,
        /// Minimum voltage in 50 mV units.
        pub raw_min_voltage: u16 @ 10..=19,
        /// Maximum current in 10 mA units.
        pub raw_max_current: u16 @ 0..=9,
    }
}

impl VariableSupply {
    /// A variable supply spanning `min_voltage_mv..=max_voltage_mv` at up to
    /// `max_current_ma`.
    pub fn new(min_voltage_mv: u32, max_voltage_mv: u32, max_current_ma: u32) -> Self {
        Self(0)
            .with_kind(PdoKind::Variable as u8)
            .with_raw_min_voltage((min_voltage_mv / 50) as u16)
            .with_raw_max_voltage((max_voltage_mv / 50) as u16)
            .with_raw_max_current((max_current_ma / 10) as u16)
    }

    /// Maximum voltage in mV.
    pub fn max_voltage_mv(&self) -> u32 {
        u32::from(self.raw_max_voltage()) * 50
    }

    /// Minimum voltage in mV.
    pub fn min_voltage_mv(&self) -> u32 {
        u32::from(self.raw_min_voltage()) * 50
    }

    /// Maximum current in mA.
    pub fn max_current_ma(&self) -> u32 {
        u32::from(self.raw_max_current()) * 10
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    /// An SPR programmable power supply APDO.
    pub struct ProgrammableSupply(pub u32): Debug, FromStorage, IntoStorage {
        /// PDO type bits.
        pub kind: u8 @ 30..=31,
        /// Augmented flavor bits.
        pub supply: u8 @ 28..=29,
        /// PPS power limited.
        pub pps_power_limited: bool @ 27,
        /// Maximum voltage in 100 mV units.
        pub raw_max_voltage: u8 @ 17..=24,
        /// Minimum voltage in 100 mV units.
        pub raw_min_voltage: u8 @ 8..=15,
        /// Maximum current in 50 mA units.
        pub raw_max_current: u8 @ 0..=6,
    }
}

impl ProgrammableSupply {
    /// Maximum voltage in mV.
    pub fn max_voltage_mv(&self) -> u32 {
        u32::from(self.raw_max_voltage()) * 100
    }

    /// Minimum voltage in mV.
    pub fn min_voltage_mv(&self) -> u32 {
        u32::from(self.raw_min_voltage()) * 100
    }

    /// Maximum current in mA.
    pub fn max_current_ma(&self) -> u32 {
        u32::from(self.raw_max_current()) * 50
    }
}

/// An augmented PDO. Only the SPR programmable (PPS) flavor is recognized;
/// others are carried raw. Augmented PDOs are validated for ordering but
/// never selected for a contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Augmented {
    /// SPR programmable power supply.
    Pps(ProgrammableSupply),
    /// Unrecognized augmented PDO, kept as the raw word.
    Unknown(u32),
}

/// A single power data object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum PowerDataObject {
    Fixed(FixedSupply),
    Battery(Battery),
    Variable(VariableSupply),
    Augmented(Augmented),
}

/// Parse a raw 32-bit word into a typed PDO.
pub fn parse_raw_pdo(word: u32) -> PowerDataObject {
    match word >> 30 {
        0b00 => PowerDataObject::Fixed(FixedSupply(word)),
        0b01 => PowerDataObject::Battery(Battery(word)),
        0b10 => PowerDataObject::Variable(VariableSupply(word)),
        _ => PowerDataObject::Augmented(match (word >> 28) & 0b11 {
            0b00 => Augmented::Pps(ProgrammableSupply(word)),
            _ => Augmented::Unknown(word),
        }),
    }
}

impl PowerDataObject {
    /// The PDO flavor.
    pub fn kind(&self) -> PdoKind {
        match self {
            Self::Fixed(_) => PdoKind::Fixed,
            Self::Battery(_) => PdoKind::Battery,
            Self::Variable(_) => PdoKind::Variable,
            Self::Augmented(_) => PdoKind::Augmented,
        }
    }

    /// The raw wire word.
    pub fn raw(&self) -> u32 {
        match self {
            Self::Fixed(pdo) => pdo.0,
            Self::Battery(pdo) => pdo.0,
            Self::Variable(pdo) => pdo.0,
            Self::Augmented(Augmented::Pps(pdo)) => pdo.0,
            Self::Augmented(Augmented::Unknown(word)) => *word,
        }
    }
}

/// Errors detected by the capability-list validator, in detection order.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CapabilityError {
    /// Source/sink caps should at least have vSafe5V.
    #[error("capabilities must at least contain vSafe5V")]
    NoVsafe5V,
    /// The vSafe5V fixed supply object shall always be the first object.
    #[error("vSafe5V fixed supply must be the first object")]
    Vsafe5VNotFirst,
    /// PDOs shall be listed in the order fixed, battery, variable, augmented.
    #[error("PDO types out of order")]
    TypeNotInOrder,
    /// Fixed supply PDOs shall be in increasing voltage order.
    #[error("fixed supply PDOs not sorted by voltage")]
    FixedNotSorted,
    /// Variable/battery PDOs shall be in increasing minimum-voltage order.
    #[error("variable/battery PDOs not sorted by minimum voltage")]
    VariableBattNotSorted,
    /// Variable/battery PDOs cannot share the same voltage span.
    #[error("duplicate variable/battery PDO")]
    DupePdo,
    /// PPS APDOs shall be in increasing maximum-voltage order.
    #[error("programmable PDOs not sorted by maximum voltage")]
    PpsApdoNotSorted,
    /// PPS APDOs cannot share voltage span and current.
    #[error("duplicate programmable PDO")]
    DupePpsApdo,
}

/// vSafe5V in mV.
const VSAFE_5V_MV: u32 = 5000;

/// A bounded list of PDOs: local or partner, source or sink capabilities.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities(pub(crate) Vec<PowerDataObject, PDO_MAX_OBJECTS>);

impl Capabilities {
    /// Build from raw PDO words, truncating to [`PDO_MAX_OBJECTS`].
    pub fn from_words(words: &[u32]) -> Self {
        Self(
            words
                .iter()
                .take(PDO_MAX_OBJECTS)
                .map(|word| parse_raw_pdo(*word))
                .collect(),
        )
    }

    /// The contained PDOs.
    pub fn pdos(&self) -> &[PowerDataObject] {
        &self.0
    }

    /// Number of PDOs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop all PDOs.
    pub fn clear(&mut self) {
        self.0.clear()
    }

    /// The vSafe5V fixed supply, if the list starts with one.
    pub fn vsafe_5v(&self) -> Option<&FixedSupply> {
        self.0.first().and_then(|pdo| {
            if let PowerDataObject::Fixed(supply) = pdo {
                Some(supply)
            } else {
                None
            }
        })
    }

    /// Whether the partner advertises dual-role power.
    pub fn dual_role_power(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::dual_role_power)
            .unwrap_or_default()
    }

    /// Whether the partner advertises dual-role data.
    pub fn dual_role_data(&self) -> bool {
        self.vsafe_5v()
            .map(FixedSupply::dual_role_data)
            .unwrap_or_default()
    }

    /// Check the list against the ordering rules of the specification.
    pub fn validate(&self) -> Result<(), CapabilityError> {
        let pdos = self.pdos();

        let Some(first) = pdos.first() else {
            return Err(CapabilityError::NoVsafe5V);
        };

        match first {
            PowerDataObject::Fixed(fixed) if fixed.voltage_mv() == VSAFE_5V_MV => (),
            _ => return Err(CapabilityError::Vsafe5VNotFirst),
        }

        for pair in pdos.windows(2) {
            let (prev, pdo) = (&pair[0], &pair[1]);

            if pdo.kind() < prev.kind() {
                return Err(CapabilityError::TypeNotInOrder);
            }

            if pdo.kind() != prev.kind() {
                continue;
            }

            match (prev, pdo) {
                // The remaining fixed supply objects, if present, shall be
                // sent in voltage order; lowest to highest.
                (PowerDataObject::Fixed(prev), PowerDataObject::Fixed(pdo)) => {
                    if pdo.voltage_mv() <= prev.voltage_mv() {
                        return Err(CapabilityError::FixedNotSorted);
                    }
                }
                // Battery and variable supply objects, if present, shall be
                // sent in minimum voltage order; lowest to highest.
                (PowerDataObject::Battery(prev), PowerDataObject::Battery(pdo)) => {
                    if pdo.min_voltage_mv() < prev.min_voltage_mv() {
                        return Err(CapabilityError::VariableBattNotSorted);
                    } else if pdo.min_voltage_mv() == prev.min_voltage_mv()
                        && pdo.max_voltage_mv() == prev.max_voltage_mv()
                    {
                        return Err(CapabilityError::DupePdo);
                    }
                }
                (PowerDataObject::Variable(prev), PowerDataObject::Variable(pdo)) => {
                    if pdo.min_voltage_mv() < prev.min_voltage_mv() {
                        return Err(CapabilityError::VariableBattNotSorted);
                    } else if pdo.min_voltage_mv() == prev.min_voltage_mv()
                        && pdo.max_voltage_mv() == prev.max_voltage_mv()
                    {
                        return Err(CapabilityError::DupePdo);
                    }
                }
                // PPS APDOs, if present, shall be sent in maximum voltage
                // order; lowest to highest.
                (
                    PowerDataObject::Augmented(Augmented::Pps(prev)),
                    PowerDataObject::Augmented(Augmented::Pps(pdo)),
                ) => {
                    if pdo.max_voltage_mv() < prev.max_voltage_mv() {
                        return Err(CapabilityError::PpsApdoNotSorted);
                    } else if pdo.min_voltage_mv() == prev.min_voltage_mv()
                        && pdo.max_voltage_mv() == prev.max_voltage_mv()
                        && pdo.max_current_ma() == prev.max_current_ma()
                    {
                        return Err(CapabilityError::DupePpsApdo);
                    }
                }
                _ => (),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(words: &[u32]) -> Capabilities {
        Capabilities::from_words(words)
    }

    #[test]
    fn valid_typical_source_caps() {
        let caps = caps(&[
            FixedSupply::new(5000, 3000).0,
            FixedSupply::new(9000, 3000).0,
            FixedSupply::new(15000, 3000).0,
            VariableSupply::new(3300, 21000, 3000).0,
        ]);
        assert_eq!(caps.validate(), Ok(()));
    }

    #[test]
    fn empty_caps_are_rejected() {
        assert_eq!(caps(&[]).validate(), Err(CapabilityError::NoVsafe5V));
    }

    #[test]
    fn vsafe_5v_must_come_first() {
        let caps = caps(&[FixedSupply::new(9000, 3000).0]);
        assert_eq!(caps.validate(), Err(CapabilityError::Vsafe5VNotFirst));

        let caps = Capabilities::from_words(&[Battery::new(3300, 9000, 10000).0]);
        assert_eq!(caps.validate(), Err(CapabilityError::Vsafe5VNotFirst));
    }

    #[test]
    fn type_order_is_enforced() {
        let caps = caps(&[
            FixedSupply::new(5000, 3000).0,
            VariableSupply::new(3300, 9000, 2000).0,
            Battery::new(3300, 9000, 10000).0,
        ]);
        assert_eq!(caps.validate(), Err(CapabilityError::TypeNotInOrder));
    }

    #[test]
    fn fixed_voltages_ascend_strictly() {
        let caps = caps(&[
            FixedSupply::new(5000, 3000).0,
            FixedSupply::new(9000, 3000).0,
            FixedSupply::new(9000, 2000).0,
        ]);
        assert_eq!(caps.validate(), Err(CapabilityError::FixedNotSorted));
    }

    #[test]
    fn variable_duplicates_are_rejected() {
        let caps = caps(&[
            FixedSupply::new(5000, 3000).0,
            VariableSupply::new(3300, 9000, 2000).0,
            VariableSupply::new(3300, 9000, 3000).0,
        ]);
        assert_eq!(caps.validate(), Err(CapabilityError::DupePdo));
    }

    #[test]
    fn battery_min_voltage_order() {
        let caps = caps(&[
            FixedSupply::new(5000, 3000).0,
            Battery::new(5000, 9000, 10000).0,
            Battery::new(3300, 9000, 10000).0,
        ]);
        assert_eq!(caps.validate(), Err(CapabilityError::VariableBattNotSorted));
    }

    #[test]
    fn pps_ordering_and_duplicates() {
        // 3.3-11 V @ 3 A followed by 3.3-11 V @ 3 A.
        let pps = |max_mv: u32, ma: u32| {
            PowerDataObject::Augmented(Augmented::Pps(
                ProgrammableSupply(0b11 << 30)
                    .with_raw_min_voltage(33)
                    .with_raw_max_voltage((max_mv / 100) as u8)
                    .with_raw_max_current((ma / 50) as u8),
            ))
            .raw()
        };

        let out_of_order = caps(&[FixedSupply::new(5000, 3000).0, pps(11000, 3000), pps(9000, 3000)]);
        assert_eq!(
            out_of_order.validate(),
            Err(CapabilityError::PpsApdoNotSorted)
        );

        let duped = caps(&[FixedSupply::new(5000, 3000).0, pps(11000, 3000), pps(11000, 3000)]);
        assert_eq!(duped.validate(), Err(CapabilityError::DupePpsApdo));
    }

    #[test]
    fn dual_role_flags_come_from_the_first_pdo() {
        let caps = caps(&[
            FixedSupply::new(5000, 3000)
                .with_dual_role_power(true)
                .with_dual_role_data(true)
                .0,
        ]);
        assert!(caps.dual_role_power());
        assert!(caps.dual_role_data());

        let caps = Capabilities::from_words(&[FixedSupply::new(5000, 3000).0]);
        assert!(!caps.dual_role_power());
        assert!(!caps.dual_role_data());
    }
}
