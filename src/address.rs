//! ISO-TP addressing information (N_AI).
//!
//! An [`Address`] defines which incoming CAN messages belong to this
//! transport instance and how outgoing messages are crafted to reach the
//! peer. Seven addressing modes are supported, covering 11-bit and 29-bit
//! identifiers, the fixed 29-bit scheme carrying target/source addresses in
//! the arbitration ID, and the extended/mixed schemes carrying an extra
//! address byte in the data field.
//!
//! Arbitration IDs and payload prefixes are computed once at construction;
//! the hot path only reads cached values.

use crate::error::{IsoTpError, Result};
use crate::types::{CanId, CanMessage};

/// The seven ISO-15765-2 addressing schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Normal11Bits,
    Normal29Bits,
    NormalFixed29Bits,
    Extended11Bits,
    Extended29Bits,
    Mixed11Bits,
    Mixed29Bits,
}

impl AddressingMode {
    pub fn is_29bits(self) -> bool {
        matches!(
            self,
            AddressingMode::Normal29Bits
                | AddressingMode::NormalFixed29Bits
                | AddressingMode::Extended29Bits
                | AddressingMode::Mixed29Bits
        )
    }
}

/// Whether a message targets a single peer or every node on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetAddressType {
    #[default]
    Physical,
    Functional,
}

/// Which direction(s) an [`Address`] is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Both,
    TxOnly,
    RxOnly,
}

/// Raw addressing parameters. Unused fields for a given mode may stay `None`.
#[derive(Debug, Clone, Default)]
pub struct AddressConfig {
    pub txid: Option<CanId>,
    pub rxid: Option<CanId>,
    pub target_address: Option<u8>,
    pub source_address: Option<u8>,
    pub address_extension: Option<u8>,
    /// Bits 28-16 of the physical arbitration ID for the fixed 29-bit
    /// modes. Standard-mandated value when `None`.
    pub physical_id: Option<CanId>,
    /// Bits 28-16 of the functional arbitration ID for the fixed 29-bit
    /// modes. Standard-mandated value when `None`.
    pub functional_id: Option<CanId>,
}

/// A validated address with precomputed arbitration IDs and prefixes.
#[derive(Debug, Clone)]
pub struct Address {
    mode: AddressingMode,
    role: Role,
    txid: Option<CanId>,
    rxid: Option<CanId>,
    target_address: Option<u8>,
    source_address: Option<u8>,
    address_extension: Option<u8>,
    physical_id: CanId,
    functional_id: CanId,
    tx_arbitration_id_physical: Option<CanId>,
    tx_arbitration_id_functional: Option<CanId>,
    rx_arbitration_id_physical: Option<CanId>,
    rx_arbitration_id_functional: Option<CanId>,
    tx_payload_prefix: Option<u8>,
    rx_prefix_size: usize,
}

impl Address {
    /// Builds an address usable for both transmission and reception.
    pub fn new(mode: AddressingMode, config: AddressConfig) -> Result<Self> {
        Self::with_role(mode, config, Role::Both)
    }

    /// Builds the transmit half of an [`AsymmetricAddress`].
    pub fn tx_only(mode: AddressingMode, config: AddressConfig) -> Result<Self> {
        Self::with_role(mode, config, Role::TxOnly)
    }

    /// Builds the receive half of an [`AsymmetricAddress`].
    pub fn rx_only(mode: AddressingMode, config: AddressConfig) -> Result<Self> {
        Self::with_role(mode, config, Role::RxOnly)
    }

    /// Normal addressing over 11-bit identifiers.
    pub fn normal_11bits(txid: CanId, rxid: CanId) -> Result<Self> {
        Self::new(
            AddressingMode::Normal11Bits,
            AddressConfig {
                txid: Some(txid),
                rxid: Some(rxid),
                ..Default::default()
            },
        )
    }

    /// Normal addressing over 29-bit identifiers.
    pub fn normal_29bits(txid: CanId, rxid: CanId) -> Result<Self> {
        Self::new(
            AddressingMode::Normal29Bits,
            AddressConfig {
                txid: Some(txid),
                rxid: Some(rxid),
                ..Default::default()
            },
        )
    }

    /// Normal fixed addressing: target/source embedded in a 29-bit ID.
    pub fn normal_fixed_29bits(target_address: u8, source_address: u8) -> Result<Self> {
        Self::new(
            AddressingMode::NormalFixed29Bits,
            AddressConfig {
                target_address: Some(target_address),
                source_address: Some(source_address),
                ..Default::default()
            },
        )
    }

    fn with_role(mode: AddressingMode, config: AddressConfig, role: Role) -> Result<Self> {
        let (physical_id, functional_id) = match mode {
            AddressingMode::NormalFixed29Bits => (
                config.physical_id.map_or(0x18DA_0000, |id| id & 0x1FFF_0000),
                config.functional_id.map_or(0x18DB_0000, |id| id & 0x1FFF_0000),
            ),
            AddressingMode::Mixed29Bits => (
                config.physical_id.map_or(0x18CE_0000, |id| id & 0x1FFF_0000),
                config.functional_id.map_or(0x18CD_0000, |id| id & 0x1FFF_0000),
            ),
            _ => (0, 0),
        };

        let mut address = Self {
            mode,
            role,
            txid: config.txid,
            rxid: config.rxid,
            target_address: config.target_address,
            source_address: config.source_address,
            address_extension: config.address_extension,
            physical_id,
            functional_id,
            tx_arbitration_id_physical: None,
            tx_arbitration_id_functional: None,
            rx_arbitration_id_physical: None,
            rx_arbitration_id_functional: None,
            tx_payload_prefix: None,
            rx_prefix_size: 0,
        };
        address.validate()?;

        if address.tx_configured() {
            address.tx_arbitration_id_physical =
                Some(address.compute_tx_arbitration_id(TargetAddressType::Physical));
            address.tx_arbitration_id_functional =
                Some(address.compute_tx_arbitration_id(TargetAddressType::Functional));
            address.tx_payload_prefix = match mode {
                AddressingMode::Extended11Bits | AddressingMode::Extended29Bits => {
                    address.target_address
                }
                AddressingMode::Mixed11Bits | AddressingMode::Mixed29Bits => {
                    address.address_extension
                }
                _ => None,
            };
        }
        if address.rx_configured() {
            address.rx_arbitration_id_physical =
                Some(address.compute_rx_arbitration_id(TargetAddressType::Physical));
            address.rx_arbitration_id_functional =
                Some(address.compute_rx_arbitration_id(TargetAddressType::Functional));
            address.rx_prefix_size = match mode {
                AddressingMode::Extended11Bits
                | AddressingMode::Extended29Bits
                | AddressingMode::Mixed11Bits
                | AddressingMode::Mixed29Bits => 1,
                _ => 0,
            };
        }
        Ok(address)
    }

    fn tx_configured(&self) -> bool {
        self.role != Role::RxOnly
    }

    fn rx_configured(&self) -> bool {
        self.role != Role::TxOnly
    }

    fn validate(&self) -> Result<()> {
        let config = |reason: String| Err(IsoTpError::Config(reason));

        match self.mode {
            AddressingMode::Normal11Bits | AddressingMode::Normal29Bits => {
                if self.tx_configured() && self.txid.is_none() {
                    return config("txid must be specified for normal addressing".into());
                }
                if self.rx_configured() && self.rxid.is_none() {
                    return config("rxid must be specified for normal addressing".into());
                }
                if self.role == Role::Both && self.txid == self.rxid {
                    return config("txid and rxid must be different for normal addressing".into());
                }
            }
            AddressingMode::NormalFixed29Bits => {
                if self.target_address.is_none() || self.source_address.is_none() {
                    return config(
                        "target_address and source_address must be specified for \
                         normal fixed addressing"
                            .into(),
                    );
                }
            }
            AddressingMode::Extended11Bits | AddressingMode::Extended29Bits => {
                if self.tx_configured() && (self.txid.is_none() || self.target_address.is_none()) {
                    return config(
                        "txid and target_address must be specified for extended addressing".into(),
                    );
                }
                if self.rx_configured() && (self.rxid.is_none() || self.source_address.is_none()) {
                    return config(
                        "rxid and source_address must be specified for extended addressing".into(),
                    );
                }
                if self.role == Role::Both && self.txid == self.rxid {
                    return config("txid and rxid must be different".into());
                }
            }
            AddressingMode::Mixed11Bits => {
                if self.address_extension.is_none() {
                    return config(
                        "address_extension must be specified for mixed addressing".into(),
                    );
                }
                if self.tx_configured() && self.txid.is_none() {
                    return config("txid must be specified for mixed addressing".into());
                }
                if self.rx_configured() && self.rxid.is_none() {
                    return config("rxid must be specified for mixed addressing".into());
                }
            }
            AddressingMode::Mixed29Bits => {
                if self.target_address.is_none()
                    || self.source_address.is_none()
                    || self.address_extension.is_none()
                {
                    return config(
                        "target_address, source_address and address_extension must be \
                         specified for mixed 29-bit addressing"
                            .into(),
                    );
                }
            }
        }

        let id_limit = if self.mode.is_29bits() { 0x1FFF_FFFF } else { 0x7FF };
        for (name, id) in [("txid", self.txid), ("rxid", self.rxid)] {
            if let Some(id) = id {
                if id > id_limit {
                    return config(format!("{name} must not exceed {id_limit:#x}"));
                }
            }
        }
        Ok(())
    }

    fn compute_tx_arbitration_id(&self, address_type: TargetAddressType) -> CanId {
        match self.mode {
            AddressingMode::NormalFixed29Bits | AddressingMode::Mixed29Bits => {
                let bits28_16 = match address_type {
                    TargetAddressType::Physical => self.physical_id,
                    TargetAddressType::Functional => self.functional_id,
                };
                bits28_16
                    | (u32::from(self.target_address.unwrap()) << 8)
                    | u32::from(self.source_address.unwrap())
            }
            _ => self.txid.unwrap(),
        }
    }

    fn compute_rx_arbitration_id(&self, address_type: TargetAddressType) -> CanId {
        match self.mode {
            AddressingMode::NormalFixed29Bits | AddressingMode::Mixed29Bits => {
                let bits28_16 = match address_type {
                    TargetAddressType::Physical => self.physical_id,
                    TargetAddressType::Functional => self.functional_id,
                };
                bits28_16
                    | (u32::from(self.source_address.unwrap()) << 8)
                    | u32::from(self.target_address.unwrap())
            }
            _ => self.rxid.unwrap(),
        }
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        self.mode
    }

    pub fn is_29bits(&self) -> bool {
        self.mode.is_29bits()
    }

    pub fn txid(&self) -> Option<CanId> {
        self.txid
    }

    pub fn rxid(&self) -> Option<CanId> {
        self.rxid
    }

    /// The arbitration ID to use for transmission, or an error when this
    /// address only carries reception parameters.
    pub fn tx_arbitration_id(&self, address_type: TargetAddressType) -> Result<CanId> {
        let id = match address_type {
            TargetAddressType::Physical => self.tx_arbitration_id_physical,
            TargetAddressType::Functional => self.tx_arbitration_id_functional,
        };
        id.ok_or_else(|| {
            IsoTpError::Config("address is not configured for transmission".into())
        })
    }

    /// The arbitration ID expected on incoming frames, or an error when
    /// this address only carries transmission parameters.
    pub fn rx_arbitration_id(&self, address_type: TargetAddressType) -> Result<CanId> {
        let id = match address_type {
            TargetAddressType::Physical => self.rx_arbitration_id_physical,
            TargetAddressType::Functional => self.rx_arbitration_id_functional,
        };
        id.ok_or_else(|| IsoTpError::Config("address is not configured for reception".into()))
    }

    /// The byte prepended to every outgoing data field, if the mode uses one.
    pub fn tx_payload_prefix(&self) -> Option<u8> {
        self.tx_payload_prefix
    }

    /// Length of `tx_payload_prefix` (0 or 1).
    pub fn tx_prefix_size(&self) -> usize {
        usize::from(self.tx_payload_prefix.is_some())
    }

    /// Number of address bytes to strip from every incoming data field.
    pub fn rx_prefix_size(&self) -> usize {
        self.rx_prefix_size
    }

    /// True when the incoming message belongs to this address.
    pub fn is_for_me(&self, msg: &CanMessage) -> bool {
        if !self.rx_configured() || msg.is_extended_id != self.is_29bits() {
            return false;
        }
        match self.mode {
            AddressingMode::Normal11Bits | AddressingMode::Normal29Bits => {
                Some(msg.arbitration_id) == self.rxid
            }
            AddressingMode::Extended11Bits | AddressingMode::Extended29Bits => {
                Some(msg.arbitration_id) == self.rxid
                    && msg.data.first().copied() == self.source_address
            }
            AddressingMode::NormalFixed29Bits => self.is_fixed_id_for_me(msg.arbitration_id),
            AddressingMode::Mixed11Bits => {
                Some(msg.arbitration_id) == self.rxid
                    && msg.data.first().copied() == self.address_extension
            }
            AddressingMode::Mixed29Bits => {
                self.is_fixed_id_for_me(msg.arbitration_id)
                    && msg.data.first().copied() == self.address_extension
            }
        }
    }

    fn is_fixed_id_for_me(&self, arbitration_id: CanId) -> bool {
        let bits28_16 = arbitration_id & 0x1FFF_0000;
        (bits28_16 == self.physical_id || bits28_16 == self.functional_id)
            && Some(((arbitration_id & 0xFF00) >> 8) as u8) == self.source_address
            && Some((arbitration_id & 0xFF) as u8) == self.target_address
    }
}

/// Pairs a transmit-only address with a receive-only address so the two
/// directions may use different addressing modes.
#[derive(Debug, Clone)]
pub struct AsymmetricAddress {
    tx: Address,
    rx: Address,
}

impl AsymmetricAddress {
    pub fn new(tx: Address, rx: Address) -> Result<Self> {
        if !tx.tx_configured() {
            return Err(IsoTpError::Config(
                "tx address of an asymmetric pair must be configured for transmission".into(),
            ));
        }
        if !rx.rx_configured() {
            return Err(IsoTpError::Config(
                "rx address of an asymmetric pair must be configured for reception".into(),
            ));
        }
        Ok(Self { tx, rx })
    }

    pub fn tx_address(&self) -> &Address {
        &self.tx
    }

    pub fn rx_address(&self) -> &Address {
        &self.rx
    }
}

/// Address accepted by the transport layer: symmetric or asymmetric.
#[derive(Debug, Clone)]
pub enum TransportAddress {
    Symmetric(Address),
    Asymmetric(AsymmetricAddress),
}

impl TransportAddress {
    fn tx_half(&self) -> &Address {
        match self {
            TransportAddress::Symmetric(addr) => addr,
            TransportAddress::Asymmetric(pair) => &pair.tx,
        }
    }

    fn rx_half(&self) -> &Address {
        match self {
            TransportAddress::Symmetric(addr) => addr,
            TransportAddress::Asymmetric(pair) => &pair.rx,
        }
    }

    pub fn is_for_me(&self, msg: &CanMessage) -> bool {
        self.rx_half().is_for_me(msg)
    }

    pub fn tx_arbitration_id(&self, address_type: TargetAddressType) -> Result<CanId> {
        self.tx_half().tx_arbitration_id(address_type)
    }

    pub fn tx_payload_prefix(&self) -> Option<u8> {
        self.tx_half().tx_payload_prefix()
    }

    pub fn tx_prefix_size(&self) -> usize {
        self.tx_half().tx_prefix_size()
    }

    pub fn rx_prefix_size(&self) -> usize {
        self.rx_half().rx_prefix_size()
    }

    pub fn is_tx_29bits(&self) -> bool {
        self.tx_half().is_29bits()
    }

    pub fn txid(&self) -> Option<CanId> {
        self.tx_half().txid()
    }

    pub fn rxid(&self) -> Option<CanId> {
        self.rx_half().rxid()
    }
}

impl From<Address> for TransportAddress {
    fn from(address: Address) -> Self {
        TransportAddress::Symmetric(address)
    }
}

impl From<AsymmetricAddress> for TransportAddress {
    fn from(pair: AsymmetricAddress) -> Self {
        TransportAddress::Asymmetric(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: CanId, data: &[u8], extended: bool) -> CanMessage {
        CanMessage::new(id, data.to_vec(), extended).unwrap()
    }

    #[test]
    fn normal_11bits_matches_rxid_only() {
        let addr = Address::normal_11bits(0x456, 0x123).unwrap();
        assert!(addr.is_for_me(&msg(0x123, &[0x02, 0x10, 0x03], false)));
        assert!(!addr.is_for_me(&msg(0x456, &[0x02, 0x10, 0x03], false)));
        assert!(!addr.is_for_me(&msg(0x123, &[0x02, 0x10, 0x03], true)));
        assert_eq!(addr.tx_arbitration_id(TargetAddressType::Physical).unwrap(), 0x456);
        assert_eq!(addr.tx_payload_prefix(), None);
        assert_eq!(addr.rx_prefix_size(), 0);
    }

    #[test]
    fn normal_addressing_rejects_equal_ids() {
        assert!(Address::normal_11bits(0x123, 0x123).is_err());
        assert!(Address::normal_11bits(0x800, 0x123).is_err());
    }

    #[test]
    fn normal_fixed_29bits_encodes_target_and_source() {
        let addr = Address::normal_fixed_29bits(0xAA, 0x55).unwrap();
        assert_eq!(
            addr.tx_arbitration_id(TargetAddressType::Physical).unwrap(),
            0x18DAAA55
        );
        assert_eq!(
            addr.tx_arbitration_id(TargetAddressType::Functional).unwrap(),
            0x18DBAA55
        );
        assert_eq!(
            addr.rx_arbitration_id(TargetAddressType::Physical).unwrap(),
            0x18DA55AA
        );
        // Mirror image of our own tx ID is for us.
        assert!(addr.is_for_me(&msg(0x18DA55AA, &[0x01, 0x00], true)));
        assert!(!addr.is_for_me(&msg(0x18DAAA55, &[0x01, 0x00], true)));
        assert!(!addr.is_for_me(&msg(0x18DA55AA, &[0x01, 0x00], false)));
    }

    #[test]
    fn extended_addressing_checks_first_byte() {
        let addr = Address::new(
            AddressingMode::Extended11Bits,
            AddressConfig {
                txid: Some(0x456),
                rxid: Some(0x123),
                target_address: Some(0xF1),
                source_address: Some(0x33),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(addr.tx_payload_prefix(), Some(0xF1));
        assert_eq!(addr.rx_prefix_size(), 1);
        assert!(addr.is_for_me(&msg(0x123, &[0x33, 0x01, 0x00], false)));
        assert!(!addr.is_for_me(&msg(0x123, &[0x34, 0x01, 0x00], false)));
    }

    #[test]
    fn mixed_29bits_checks_id_and_extension() {
        let addr = Address::new(
            AddressingMode::Mixed29Bits,
            AddressConfig {
                target_address: Some(0xAA),
                source_address: Some(0x55),
                address_extension: Some(0x99),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(
            addr.tx_arbitration_id(TargetAddressType::Physical).unwrap(),
            0x18CEAA55
        );
        assert!(addr.is_for_me(&msg(0x18CE55AA, &[0x99, 0x01, 0x00], true)));
        assert!(addr.is_for_me(&msg(0x18CD55AA, &[0x99, 0x01, 0x00], true)));
        assert!(!addr.is_for_me(&msg(0x18CE55AA, &[0x98, 0x01, 0x00], true)));
    }

    #[test]
    fn asymmetric_pair_delegates_per_direction() {
        let tx = Address::tx_only(
            AddressingMode::Normal11Bits,
            AddressConfig {
                txid: Some(0x456),
                ..Default::default()
            },
        )
        .unwrap();
        let rx = Address::rx_only(
            AddressingMode::Mixed11Bits,
            AddressConfig {
                rxid: Some(0x123),
                address_extension: Some(0x42),
                ..Default::default()
            },
        )
        .unwrap();
        let addr: TransportAddress = AsymmetricAddress::new(tx, rx).unwrap().into();
        assert_eq!(addr.tx_arbitration_id(TargetAddressType::Physical).unwrap(), 0x456);
        assert_eq!(addr.tx_payload_prefix(), None);
        assert_eq!(addr.rx_prefix_size(), 1);
        assert!(addr.is_for_me(&msg(0x123, &[0x42, 0x02, 0x01, 0x02], false)));
    }

    #[test]
    fn partial_address_refuses_unconfigured_direction() {
        let rx = Address::rx_only(
            AddressingMode::Normal11Bits,
            AddressConfig {
                rxid: Some(0x123),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(rx.tx_arbitration_id(TargetAddressType::Physical).is_err());

        let tx = Address::tx_only(
            AddressingMode::Normal11Bits,
            AddressConfig {
                txid: Some(0x456),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!tx.is_for_me(&msg(0x456, &[0x01, 0x00], false)));
    }
}
