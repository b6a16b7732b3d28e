// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Layouts of the device registers used by the chassis port manager.
//!
//! Each register is exchanged with the device as a fixed-length, big-endian
//! payload.  The same structure describes both the request and the response:
//! the caller fills in the request fields and the device fills in the rest,
//! just as the underlying transport reuses a single buffer.

use bytes::Buf;
use bytes::BufMut;
use serde::Deserialize;
use serde::Serialize;

use common::network::MacAddr;
use common::network::ETH_ALEN;
use common::ports::LocalPort;
use common::ports::SlotIndex;

use crate::AalError;
use crate::AalResult;

/// Identifies a register on the wire.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum RegId {
    /// Management General Peripheral Information Register
    Mgpir = 0x9100,
    /// Management DownStream Device Query Register
    Mddq = 0x9161,
    /// Port Physical Address Register
    Ppad = 0x5005,
    /// Switch Physical Address Register
    Spad = 0x2002,
}

/// A register payload that may be packed for, and unpacked from, the
/// transport.
pub trait Register: Sized {
    const ID: RegId;
    const LEN: usize;

    fn pack(&self) -> Vec<u8>;
    fn unpack(data: &[u8]) -> AalResult<Self>;
}

fn check_len<R: Register>(data: &[u8]) -> AalResult<()> {
    if data.len() < R::LEN {
        Err(AalError::Malformed {
            reg: R::ID,
            len: data.len(),
            expected: R::LEN,
        })
    } else {
        Ok(())
    }
}

fn finish<R: Register>(mut buf: Vec<u8>) -> Vec<u8> {
    buf.resize(R::LEN, 0);
    buf
}

fn get_mac(buf: &mut &[u8]) -> MacAddr {
    let mut octets = [0u8; ETH_ALEN];
    buf.copy_to_slice(&mut octets);
    MacAddr::from(octets)
}

/// Peripheral information for the main board or a line card.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mgpir {
    pub slot_index: SlotIndex,
    pub device_type: u8,
    pub devices_per_flash: u8,
    pub num_of_devices: u8,
    /// The number of modules in the queried slot.
    pub num_of_modules: u8,
    /// The number of pluggable line card slots.  Zero on a chassis without
    /// line card support.
    pub num_of_slots: u8,
    pub max_modules_per_slot: u8,
}

impl Mgpir {
    pub fn request(slot_index: SlotIndex) -> Self {
        Mgpir {
            slot_index,
            ..Default::default()
        }
    }
}

impl Register for Mgpir {
    const ID: RegId = RegId::Mgpir;
    const LEN: usize = 16;

    fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_u8(self.slot_index);
        buf.put_u8(self.device_type);
        buf.put_u8(self.devices_per_flash);
        buf.put_u8(self.num_of_devices);
        buf.put_u8(self.num_of_modules);
        buf.put_u8(self.num_of_slots);
        buf.put_u8(self.max_modules_per_slot);
        finish::<Self>(buf)
    }

    fn unpack(data: &[u8]) -> AalResult<Self> {
        check_len::<Self>(data)?;
        let mut buf = data;
        Ok(Mgpir {
            slot_index: buf.get_u8(),
            device_type: buf.get_u8(),
            devices_per_flash: buf.get_u8(),
            num_of_devices: buf.get_u8(),
            num_of_modules: buf.get_u8(),
            num_of_slots: buf.get_u8(),
            max_modules_per_slot: buf.get_u8(),
        })
    }
}

const MDDQ_QUERY_SLOT_INFO: u8 = 1;

const MDDQ_PROVISIONED: u8 = 1 << 0;
const MDDQ_SR_VALID: u8 = 1 << 1;
const MDDQ_LC_READY: u8 = 1 << 2;
const MDDQ_ACTIVE: u8 = 1 << 3;

/// Status of a single line card slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mddq {
    pub slot_index: SlotIndex,
    pub provisioned: bool,
    pub sr_valid: bool,
    pub lc_ready: bool,
    pub active: bool,
    pub card_type: u8,
    pub hw_revision: u16,
    pub ini_file_version: u16,
}

impl Mddq {
    pub fn slot_info_request(slot_index: SlotIndex) -> Self {
        Mddq {
            slot_index,
            ..Default::default()
        }
    }
}

impl Register for Mddq {
    const ID: RegId = RegId::Mddq;
    const LEN: usize = 16;

    fn pack(&self) -> Vec<u8> {
        let mut flags = 0u8;
        for (set, bit) in [
            (self.provisioned, MDDQ_PROVISIONED),
            (self.sr_valid, MDDQ_SR_VALID),
            (self.lc_ready, MDDQ_LC_READY),
            (self.active, MDDQ_ACTIVE),
        ] {
            if set {
                flags |= bit;
            }
        }

        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_u8(MDDQ_QUERY_SLOT_INFO);
        buf.put_u8(self.slot_index);
        buf.put_u8(flags);
        buf.put_u8(self.card_type);
        buf.put_u16(self.hw_revision);
        buf.put_u16(self.ini_file_version);
        finish::<Self>(buf)
    }

    fn unpack(data: &[u8]) -> AalResult<Self> {
        check_len::<Self>(data)?;
        let mut buf = data;
        let query_type = buf.get_u8();
        if query_type != MDDQ_QUERY_SLOT_INFO {
            return Err(AalError::InvalidArg(format!(
                "unsupported MDDQ query type {query_type}"
            )));
        }
        let slot_index = buf.get_u8();
        let flags = buf.get_u8();
        Ok(Mddq {
            slot_index,
            provisioned: flags & MDDQ_PROVISIONED != 0,
            sr_valid: flags & MDDQ_SR_VALID != 0,
            lc_ready: flags & MDDQ_LC_READY != 0,
            active: flags & MDDQ_ACTIVE != 0,
            card_type: buf.get_u8(),
            hw_revision: buf.get_u16(),
            ini_file_version: buf.get_u16(),
        })
    }
}

/// The base MAC address from which port addresses are derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ppad {
    pub single_base_mac: bool,
    pub local_port: LocalPort,
    pub mac: MacAddr,
}

impl Ppad {
    pub fn request(single_base_mac: bool, local_port: LocalPort) -> Self {
        Ppad {
            single_base_mac,
            local_port,
            mac: MacAddr::ZERO,
        }
    }
}

impl Register for Ppad {
    const ID: RegId = RegId::Ppad;
    const LEN: usize = 16;

    fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_u8(self.single_base_mac as u8);
        buf.put_u8(0);
        buf.put_u16(self.local_port);
        buf.put_slice(&self.mac.octets());
        finish::<Self>(buf)
    }

    fn unpack(data: &[u8]) -> AalResult<Self> {
        check_len::<Self>(data)?;
        let mut buf = data;
        let single_base_mac = buf.get_u8() != 0;
        buf.advance(1);
        let local_port = buf.get_u16();
        let mac = get_mac(&mut buf);
        Ok(Ppad {
            single_base_mac,
            local_port,
            mac,
        })
    }
}

/// The switch-wide base MAC address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Spad {
    pub base_mac: MacAddr,
}

impl Spad {
    pub fn request() -> Self {
        Spad {
            base_mac: MacAddr::ZERO,
        }
    }
}

impl Register for Spad {
    const ID: RegId = RegId::Spad;
    const LEN: usize = 16;

    fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_slice(&self.base_mac.octets());
        finish::<Self>(buf)
    }

    fn unpack(data: &[u8]) -> AalResult<Self> {
        check_len::<Self>(data)?;
        let mut buf = data;
        Ok(Spad {
            base_mac: get_mac(&mut buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_mgpir_layout() {
        let reg = Mgpir {
            slot_index: 2,
            num_of_modules: 16,
            num_of_slots: 8,
            max_modules_per_slot: 16,
            ..Default::default()
        };
        let buf = reg.pack();
        assert_eq!(buf.len(), Mgpir::LEN);
        assert_eq!(&buf[..7], &[2, 0, 0, 0, 16, 8, 16]);
        assert!(buf[7..].iter().all(|b| *b == 0));
        assert_eq!(Mgpir::unpack(&buf).unwrap(), reg);
    }

    #[test]
    fn test_mddq_flags() {
        let reg = Mddq {
            slot_index: 3,
            provisioned: true,
            active: true,
            hw_revision: 0x0102,
            ..Default::default()
        };
        let buf = reg.pack();
        assert_eq!(buf[0], MDDQ_QUERY_SLOT_INFO);
        assert_eq!(buf[2], MDDQ_PROVISIONED | MDDQ_ACTIVE);
        assert_eq!(&buf[4..6], &[0x01, 0x02]);

        let back = Mddq::unpack(&buf).unwrap();
        assert!(back.active);
        assert!(!back.lc_ready);
        assert_eq!(back, reg);
    }

    #[test]
    fn test_mddq_bad_query_type() {
        let mut buf = Mddq::slot_info_request(1).pack();
        buf[0] = 7;
        assert!(matches!(Mddq::unpack(&buf), Err(AalError::InvalidArg(_))));
    }

    #[test]
    fn test_short_payload() {
        let err = Ppad::unpack(&[0u8; 4]).unwrap_err();
        match err {
            AalError::Malformed { reg, len, expected } => {
                assert_eq!(reg, RegId::Ppad);
                assert_eq!(len, 4);
                assert_eq!(expected, Ppad::LEN);
            }
            e => panic!("unexpected error: {e:?}"),
        }
    }

    #[test]
    fn test_ppad_mac() {
        let mac = MacAddr::new(0x0c, 0x42, 0xa1, 0x00, 0x10, 0x00);
        let reg = Ppad {
            mac,
            ..Ppad::request(false, 0)
        };
        let buf = reg.pack();
        assert_eq!(&buf[4..10], &mac.octets());
        assert_eq!(Ppad::unpack(&buf).unwrap().mac, mac);
    }

    #[test]
    fn test_reg_names() {
        assert_eq!(RegId::Mgpir.to_string(), "MGPIR");
        assert_eq!(RegId::Spad.to_string(), "SPAD");

        let ids: Vec<u16> = RegId::iter().map(|id| id as u16).collect();
        assert_eq!(ids, vec![0x9100, 0x9161, 0x5005, 0x2002]);
    }
}
