// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Debug Module Interface frame encoding.
//!
//! The RP2350 exposes the RISC-V Debug Transport Module behind a dedicated
//! Access Port ([`crate::rp::RISCV_AP`]).  The DTM registers are laid out in
//! AP bank 0:
//!
//! | AP reg | Contents |
//! |--------|----------|
//! | 0x00   | `dtmcs`, exactly as RISC-V Debug 0.13 section 6.1.4 |
//! | 0x04   | `DMI_LO` - bits 31:0 of the `{addr, data[33:2], op[1:0]}` frame |
//! | 0x08   | `DMI_HI` - bits 63:32 of the frame; writing it launches the op |
//!
//! A DMI request is the Debug-spec frame `{addr, data[33:2], op[1:0]}`,
//! `abits` wide in the address part, split across the two 32-bit registers.
//! On read-back the low two bits carry the operation status instead of the
//! op.  All shifts below are parameterised on `abits` (`dtmcs` reports it;
//! 7 bits on the RP2350).

use crate::arm::register::ApRegister;
use crate::register_conversions;
use bitfield::bitfield;

/// Bit offset of the data field within the DMI frame.
pub const DMI_DATA_OFFSET: u32 = 2;
/// Bit offset of the address field within the DMI frame.
pub const DMI_ADDRESS_OFFSET: u32 = 34;

/// DMI operation, the low two bits of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiOp {
    Nop = 0,
    Read = 1,
    Write = 2,
}

/// DMI operation status, the low two bits of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmiStatus {
    Ok = 0,
    Reserved = 1,
    Failed = 2,
    Busy = 3,
}

impl From<u32> for DmiStatus {
    fn from(value: u32) -> Self {
        match value & 0b11 {
            0 => DmiStatus::Ok,
            1 => DmiStatus::Reserved,
            2 => DmiStatus::Failed,
            _ => DmiStatus::Busy,
        }
    }
}

/// Pack a DMI request into `(DMI_LO, DMI_HI)` words.
pub fn pack_request(addr: u32, data: u32, op: DmiOp, abits: u8) -> (u32, u32) {
    debug_assert!(abits <= 30);
    debug_assert!(addr < (1 << abits));

    let frame = ((addr as u64) << DMI_ADDRESS_OFFSET)
        | ((data as u64) << DMI_DATA_OFFSET)
        | (op as u64);
    (frame as u32, (frame >> 32) as u32)
}

/// Unpack a `(DMI_LO, DMI_HI)` response into status and data.
pub fn unpack_response(lo: u32, hi: u32) -> (DmiStatus, u32) {
    let frame = (lo as u64) | ((hi as u64) << 32);
    let data = (frame >> DMI_DATA_OFFSET) as u32;
    (DmiStatus::from(lo), data)
}

bitfield! {
    /// `dtmcs`, surfaced as AP register 0x00.  `dmireset` clears a sticky
    /// busy/error condition without disturbing DMI state.
    #[derive(Copy, Clone)]
    pub struct Dtmcs(u32);
    impl Debug;

    pub dmihardreset, set_dmihardreset: 17;
    pub dmireset, set_dmireset: 16;
    pub idle, _: 14, 12;
    pub dmistat, _: 11, 10;
    pub abits, _: 9, 4;
    pub version, _: 3, 0;
}

impl ApRegister for Dtmcs {
    const ADDR: u8 = 0x00;
    const NAME: &'static str = "DTMCS";
}

impl From<u32> for Dtmcs {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dtmcs> for u32 {
    fn from(register: Dtmcs) -> u32 {
        register.0
    }
}

/// Low word of the DMI frame (AP register 0x04).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmiLo(pub u32);

register_conversions!(DmiLo);

impl ApRegister for DmiLo {
    const ADDR: u8 = 0x04;
    const NAME: &'static str = "DMI_LO";
}

/// High word of the DMI frame (AP register 0x08).  Writing this register
/// launches the operation held in both words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmiHi(pub u32);

register_conversions!(DmiHi);

impl ApRegister for DmiHi {
    const ADDR: u8 = 0x08;
    const NAME: &'static str = "DMI_HI";
}
