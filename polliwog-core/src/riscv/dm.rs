// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Debug Module registers, per RISC-V External Debug Support 0.13.2
//! section 3.12.  Addresses are DMI addresses.

#![allow(clippy::inconsistent_digit_grouping)]

use bitfield::bitfield;

/// A register in the Debug Module's DMI address space.
pub trait DmRegister: From<u32> + Into<u32> {
    const ADDR: u8;
    const NAME: &'static str;
}

/// Declare a plain 32-bit DM data register.
macro_rules! dm_data_register {
    ($(#[$doc:meta])* $name:ident, $addr:expr, $reg_name:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub u32);

        impl DmRegister for $name {
            const ADDR: u8 = $addr;
            const NAME: &'static str = $reg_name;
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value.0
            }
        }
    };
}

/// Implement the raw conversions for a `bitfield!` register.
macro_rules! dm_bitfield_register {
    ($name:ident, $addr:expr, $reg_name:literal) => {
        impl DmRegister for $name {
            const ADDR: u8 = $addr;
            const NAME: &'static str = $reg_name;
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u32 {
            fn from(register: $name) -> u32 {
                register.0
            }
        }
    };
}

bitfield! {
    /// `dmcontrol` (0x10) - the Debug Module's main control register.
    #[derive(Copy, Clone)]
    pub struct Dmcontrol(u32);
    impl Debug;

    pub haltreq, set_haltreq: 31;
    pub resumereq, set_resumereq: 30;
    pub hartreset, set_hartreset: 29;
    pub ackhavereset, set_ackhavereset: 28;
    pub hasel, set_hasel: 26;
    pub hartsello, set_hartsello: 25, 16;
    pub hartselhi, set_hartselhi: 15, 6;
    pub ndmreset, set_ndmreset: 1;
    pub dmactive, set_dmactive: 0;
}

impl Dmcontrol {
    /// Currently selected hart - hartselhi and hartsello combined.
    pub fn hartsel(&self) -> u32 {
        self.hartselhi() << 10 | self.hartsello()
    }

    /// Select a hart.  20 bit field, larger values are truncated.
    pub fn set_hartsel(&mut self, value: u32) {
        self.set_hartsello(value & 0x3FF);
        self.set_hartselhi((value >> 10) & 0x3FF);
    }
}

dm_bitfield_register!(Dmcontrol, 0x10, "dmcontrol");

bitfield! {
    /// Read-only `dmstatus` (0x11).  The `all*`/`any*` pairs summarise the
    /// harts selected by `dmcontrol.hartsel`.
    #[derive(Copy, Clone)]
    pub struct Dmstatus(u32);
    impl Debug;

    pub impebreak, _: 22;
    pub allhavereset, _: 19;
    pub anyhavereset, _: 18;
    pub allresumeack, _: 17;
    pub anyresumeack, _: 16;
    pub allnonexistent, _: 15;
    pub anynonexistent, _: 14;
    pub allunavail, _: 13;
    pub anyunavail, _: 12;
    pub allrunning, _: 11;
    pub anyrunning, _: 10;
    pub allhalted, _: 9;
    pub anyhalted, _: 8;
    pub authenticated, _: 7;
    pub hasresethaltreq, _: 5;
    pub version, _: 3, 0;
}

dm_bitfield_register!(Dmstatus, 0x11, "dmstatus");

impl Dmstatus {
    /// The module is responsive once the selected hart reports a definite
    /// execution state.
    pub fn responsive(&self) -> bool {
        self.allrunning() || self.allhalted()
    }
}

bitfield! {
    /// `hartinfo` (0x12).
    #[derive(Copy, Clone)]
    pub struct Hartinfo(u32);
    impl Debug;

    pub nscratch, _: 23, 20;
    pub dataaccess, _: 16;
    pub datasize, _: 15, 12;
    pub dataaddr, _: 11, 0;
}

dm_bitfield_register!(Hartinfo, 0x12, "hartinfo");

bitfield! {
    /// `abstractcs` (0x16).  `cmderr` is write-1-to-clear.
    #[derive(Copy, Clone)]
    pub struct Abstractcs(u32);
    impl Debug;

    pub progbufsize, _: 28, 24;
    pub busy, _: 12;
    pub cmderr, set_cmderr: 10, 8;
    pub datacount, _: 3, 0;
}

dm_bitfield_register!(Abstractcs, 0x16, "abstractcs");

impl Abstractcs {
    /// An `abstractcs` write that only clears `cmderr`.
    pub fn clear_cmderr() -> Self {
        let mut cs = Abstractcs(0);
        cs.set_cmderr(0x7);
        cs
    }
}

bitfield! {
    /// Access Register abstract command encoding (cmdtype 0), written to
    /// `command` (0x17).
    #[derive(Copy, Clone)]
    pub struct AccessRegisterCommand(u32);
    impl Debug;

    pub cmdtype, set_cmdtype: 31, 24;
    pub aarsize, set_aarsize: 22, 20;
    pub aarpostincrement, set_aarpostincrement: 19;
    pub postexec, set_postexec: 18;
    pub transfer, set_transfer: 17;
    pub write, set_write: 16;
    pub regno, set_regno: 15, 0;
}

impl AccessRegisterCommand {
    /// `aarsize` value for a 32-bit access.
    pub const AARSIZE_32: u32 = 2;
}

dm_bitfield_register!(AccessRegisterCommand, 0x17, "command");

bitfield! {
    /// System Bus Access control and status, `sbcs` (0x38).  `sberror` and
    /// `sbbusyerror` are write-1-to-clear.
    #[derive(Copy, Clone)]
    pub struct Sbcs(u32);
    impl Debug;

    pub sbversion, _: 31, 29;
    pub sbbusyerror, set_sbbusyerror: 22;
    pub sbbusy, _: 21;
    pub sbreadonaddr, set_sbreadonaddr: 20;
    pub sbaccess, set_sbaccess: 19, 17;
    pub sbautoincrement, set_sbautoincrement: 16;
    pub sbreadondata, set_sbreadondata: 15;
    pub sberror, set_sberror: 14, 12;
    pub sbasize, _: 11, 5;
    pub sbaccess128, _: 4;
    pub sbaccess64, _: 3;
    pub sbaccess32, _: 2;
    pub sbaccess16, _: 1;
    pub sbaccess8, _: 0;
}

dm_bitfield_register!(Sbcs, 0x38, "sbcs");

impl Sbcs {
    /// `sbaccess` value for 32-bit transfers.
    pub const SBACCESS_32: u32 = 2;

    /// An `sbcs` write clearing `sberror` and `sbbusyerror`.
    pub fn clear_errors() -> Self {
        let mut sbcs = Sbcs(0);
        sbcs.set_sberror(0x7);
        sbcs.set_sbbusyerror(true);
        sbcs
    }
}

bitfield! {
    /// The `dcsr` CSR (0x7B0).  Not a DM register, but owned by the debug
    /// stack: `step` drives single-stepping and `cause` reports why the
    /// hart halted.
    #[derive(Copy, Clone)]
    pub struct Dcsr(u32);
    impl Debug;

    pub xdebugver, _: 31, 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stepie, set_stepie: 11;
    pub stopcount, set_stopcount: 10;
    pub stoptime, set_stoptime: 9;
    pub cause, _: 8, 6;
    pub mprven, set_mprven: 4;
    pub nmip, _: 3;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

impl From<u32> for Dcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcsr> for u32 {
    fn from(register: Dcsr) -> u32 {
        register.0
    }
}

dm_data_register! {
    /// `data0` (0x04) - abstract command argument / result.
    Data0, 0x04, "data0"
}
dm_data_register! {
    /// `data1` (0x05).
    Data1, 0x05, "data1"
}
dm_data_register! {
    /// `command` (0x17) as a raw word, for pre-encoded commands.
    Command, 0x17, "command"
}
dm_data_register! { Progbuf0, 0x20, "progbuf0" }
dm_data_register! { Progbuf1, 0x21, "progbuf1" }
dm_data_register! { Progbuf2, 0x22, "progbuf2" }
dm_data_register! { Progbuf3, 0x23, "progbuf3" }
dm_data_register! {
    /// `sbaddress0` (0x39) - System Bus Access address.
    Sbaddress0, 0x39, "sbaddress0"
}
dm_data_register! {
    /// `sbdata0` (0x3C) - System Bus Access data.
    Sbdata0, 0x3C, "sbdata0"
}
