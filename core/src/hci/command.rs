//! HCI command definitions and parameter encoding
//!
//! Only the commands the mesh advertising bearer needs are modelled. Every
//! command knows its opcode and encodes its parameters in controller byte
//! order (little endian).

use serde::{Deserialize, Serialize};
use std::fmt;

/// H4 packet indicator for HCI commands
pub const H4_COMMAND_PKT: u8 = 0x01;

/// Size of the advertising data field of LE Set Advertising Data
pub const ADV_DATA_CAPACITY: usize = 31;

/// HCI opcodes (OGF << 10 | OCF)
pub mod opcode {
    pub const SET_EVENT_MASK: u16 = 0x0c01;
    pub const RESET: u16 = 0x0c03;
    pub const READ_LOCAL_COMMANDS: u16 = 0x1002;
    pub const READ_LOCAL_FEATURES: u16 = 0x1003;
    pub const LE_SET_EVENT_MASK: u16 = 0x2001;
    pub const LE_SET_RANDOM_ADDRESS: u16 = 0x2005;
    pub const LE_SET_ADV_PARAMETERS: u16 = 0x2006;
    pub const LE_SET_ADV_DATA: u16 = 0x2008;
    pub const LE_SET_ADV_ENABLE: u16 = 0x200a;
    pub const LE_SET_SCAN_PARAMETERS: u16 = 0x200b;
    pub const LE_SET_SCAN_ENABLE: u16 = 0x200c;
    /// Vendor advertising statistics (sequence number + repeat count)
    pub const VENDOR_SET_ADV_STAT: u16 = 0xfc3c;
}

/// Event mask: Disconnection Complete, Encryption Change, Read Remote Version
/// Information Complete, Hardware Error, Data Buffer Overflow, Encryption Key
/// Refresh Complete, LE Meta (0x2000800002008890)
pub const EVENT_MASK: [u8; 8] = [0x90, 0x88, 0x00, 0x02, 0x00, 0x80, 0x00, 0x20];

/// LE event mask: connection, advertising report, connection update, remote
/// features, LTK request, remote connection parameter request, data length
/// change, PHY update (0x000000000000087f)
pub const LE_EVENT_MASK: [u8; 8] = [0x7f, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Non-connectable undirected advertising (ADV_NONCONN_IND)
pub const ADV_TYPE_NONCONN_IND: u8 = 0x03;

/// All three primary advertising channels
pub const ADV_CHANNEL_MAP_ALL: u8 = 0x07;

pub const OWN_ADDR_PUBLIC: u8 = 0x00;
pub const OWN_ADDR_RANDOM: u8 = 0x01;

pub const SCAN_TYPE_PASSIVE: u8 = 0x00;
pub const SCAN_TYPE_ACTIVE: u8 = 0x01;

/// Convert milliseconds to 0.625 ms controller units, saturating at the field width.
pub fn ms_to_units(ms: u16) -> u16 {
    let units = (ms as u32 * 16) / 10;
    units.min(u16::MAX as u32) as u16
}

/// LE Set Advertising Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvParameters {
    pub min_interval: u16,
    pub max_interval: u16,
    pub adv_type: u8,
    pub own_addr_type: u8,
    pub direct_addr_type: u8,
    pub direct_addr: [u8; 6],
    pub channel_map: u8,
    pub filter_policy: u8,
}

impl AdvParameters {
    /// Parameters for a mesh advertising burst at a fixed interval
    pub fn non_connectable(interval_ms: u16) -> Self {
        let interval = ms_to_units(interval_ms);
        Self {
            min_interval: interval,
            max_interval: interval,
            adv_type: ADV_TYPE_NONCONN_IND,
            own_addr_type: OWN_ADDR_PUBLIC,
            direct_addr_type: 0x00,
            direct_addr: [0u8; 6],
            channel_map: ADV_CHANNEL_MAP_ALL,
            filter_policy: 0x03,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.min_interval.to_le_bytes());
        out.extend_from_slice(&self.max_interval.to_le_bytes());
        out.push(self.adv_type);
        out.push(self.own_addr_type);
        out.push(self.direct_addr_type);
        out.extend_from_slice(&self.direct_addr);
        out.push(self.channel_map);
        out.push(self.filter_policy);
    }
}

/// LE Set Scan Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParameters {
    pub scan_type: u8,
    pub interval: u16,
    pub window: u16,
    pub own_addr_type: u8,
    pub filter_policy: u8,
}

impl ScanParameters {
    /// Passive scan programmed during controller bring-up (30 ms interval/window)
    pub fn bring_up() -> Self {
        Self {
            scan_type: SCAN_TYPE_PASSIVE,
            interval: 0x0030,
            window: 0x0030,
            own_addr_type: OWN_ADDR_PUBLIC,
            filter_policy: 0x00,
        }
    }

    /// Continuous 10 ms scanning used while receivers are registered
    pub fn mesh(active: bool) -> Self {
        Self {
            scan_type: if active { SCAN_TYPE_ACTIVE } else { SCAN_TYPE_PASSIVE },
            interval: 0x0010,
            window: 0x0010,
            own_addr_type: OWN_ADDR_RANDOM,
            filter_policy: 0x00,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.scan_type);
        out.extend_from_slice(&self.interval.to_le_bytes());
        out.extend_from_slice(&self.window.to_le_bytes());
        out.push(self.own_addr_type);
        out.push(self.filter_policy);
    }
}

/// LE Set Advertising Data payload: one length-prefixed mesh AD structure,
/// zero padded to the full data field.
#[derive(Clone, PartialEq, Eq)]
pub struct AdvData {
    len: u8,
    data: [u8; ADV_DATA_CAPACITY],
}

impl AdvData {
    /// Wrap a mesh packet (AD type byte followed by its payload) as a single
    /// AD structure. Returns `None` when it does not fit.
    pub fn from_packet(packet: &[u8]) -> Option<Self> {
        if packet.is_empty() || packet.len() >= ADV_DATA_CAPACITY {
            return None;
        }
        let mut data = [0u8; ADV_DATA_CAPACITY];
        data[0] = packet.len() as u8;
        data[1..=packet.len()].copy_from_slice(packet);
        Some(Self {
            len: packet.len() as u8 + 1,
            data,
        })
    }

    /// Significant bytes of the advertising data
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for AdvData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdvData({})", hex::encode(self.as_bytes()))
    }
}

/// Commands issued by the mesh bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciCommand {
    Reset,
    ReadLocalCommands,
    ReadLocalFeatures,
    SetEventMask([u8; 8]),
    LeSetEventMask([u8; 8]),
    LeSetRandomAddress([u8; 6]),
    LeSetAdvParameters(AdvParameters),
    LeSetAdvData(AdvData),
    LeSetAdvEnable(bool),
    LeSetScanParameters(ScanParameters),
    LeSetScanEnable { enable: bool, filter_duplicates: bool },
    VendorSetAdvStat { seqn: u32, count: u32 },
}

impl HciCommand {
    pub fn opcode(&self) -> u16 {
        match self {
            HciCommand::Reset => opcode::RESET,
            HciCommand::ReadLocalCommands => opcode::READ_LOCAL_COMMANDS,
            HciCommand::ReadLocalFeatures => opcode::READ_LOCAL_FEATURES,
            HciCommand::SetEventMask(_) => opcode::SET_EVENT_MASK,
            HciCommand::LeSetEventMask(_) => opcode::LE_SET_EVENT_MASK,
            HciCommand::LeSetRandomAddress(_) => opcode::LE_SET_RANDOM_ADDRESS,
            HciCommand::LeSetAdvParameters(_) => opcode::LE_SET_ADV_PARAMETERS,
            HciCommand::LeSetAdvData(_) => opcode::LE_SET_ADV_DATA,
            HciCommand::LeSetAdvEnable(_) => opcode::LE_SET_ADV_ENABLE,
            HciCommand::LeSetScanParameters(_) => opcode::LE_SET_SCAN_PARAMETERS,
            HciCommand::LeSetScanEnable { .. } => opcode::LE_SET_SCAN_ENABLE,
            HciCommand::VendorSetAdvStat { .. } => opcode::VENDOR_SET_ADV_STAT,
        }
    }

    /// Encoded command parameters
    pub fn params(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            HciCommand::Reset | HciCommand::ReadLocalCommands | HciCommand::ReadLocalFeatures => {}
            HciCommand::SetEventMask(mask) | HciCommand::LeSetEventMask(mask) => {
                out.extend_from_slice(mask)
            }
            HciCommand::LeSetRandomAddress(addr) => out.extend_from_slice(addr),
            HciCommand::LeSetAdvParameters(params) => params.encode(&mut out),
            HciCommand::LeSetAdvData(data) => {
                out.push(data.len);
                out.extend_from_slice(&data.data);
            }
            HciCommand::LeSetAdvEnable(enable) => out.push(*enable as u8),
            HciCommand::LeSetScanParameters(params) => params.encode(&mut out),
            HciCommand::LeSetScanEnable {
                enable,
                filter_duplicates,
            } => {
                out.push(*enable as u8);
                out.push(*filter_duplicates as u8);
            }
            HciCommand::VendorSetAdvStat { seqn, count } => {
                out.extend_from_slice(&seqn.to_le_bytes());
                out.extend_from_slice(&count.to_le_bytes());
            }
        }
        out
    }

    /// Full H4 command packet: indicator, opcode, parameter length, parameters
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.params();
        let mut packet = Vec::with_capacity(4 + params.len());
        packet.push(H4_COMMAND_PKT);
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }

    /// Short human readable name, used in logs
    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode())
    }
}

impl fmt::Display for HciCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#06x})", self.name(), self.opcode())
    }
}

pub fn opcode_name(op: u16) -> &'static str {
    match op {
        opcode::SET_EVENT_MASK => "Set Event Mask",
        opcode::RESET => "Reset",
        opcode::READ_LOCAL_COMMANDS => "Read Local Supported Commands",
        opcode::READ_LOCAL_FEATURES => "Read Local Supported Features",
        opcode::LE_SET_EVENT_MASK => "LE Set Event Mask",
        opcode::LE_SET_RANDOM_ADDRESS => "LE Set Random Address",
        opcode::LE_SET_ADV_PARAMETERS => "LE Set Advertising Parameters",
        opcode::LE_SET_ADV_DATA => "LE Set Advertising Data",
        opcode::LE_SET_ADV_ENABLE => "LE Set Advertising Enable",
        opcode::LE_SET_SCAN_PARAMETERS => "LE Set Scan Parameters",
        opcode::LE_SET_SCAN_ENABLE => "LE Set Scan Enable",
        opcode::VENDOR_SET_ADV_STAT => "Vendor Set Advertising Statistics",
        _ => "Unknown",
    }
}
