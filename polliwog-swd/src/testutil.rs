// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Host-side mock target for the stack's tests.
//!
//! [`MockLink`] implements [`SwdIo`] and fronts a simulated RP2350: a SW-DP
//! with posted AP reads and sticky error flags, the RISC-V AP's DTM
//! registers, a 0.13 Debug Module with two harts, SRAM, and a just-enough
//! RV32I interpreter so program-buffer snippets and single steps behave
//! like silicon.  Everything is scripted through plain setters
//! (`set_wait_count`, `set_fault_next`, ...) so tests can poke exact
//! failure modes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::vec::Vec;

use polliwog_core::parity;
use polliwog_core::rp;

use crate::SwdError;
use crate::protocol::SwdIo;

const DPC: u16 = 0x7B1;
const DCSR: u16 = 0x7B0;
const EBREAK: u32 = 0x0010_0073;

// One poke of garbage so a skipped RDBUFF dance is visible
const STALE: u32 = 0xDEAD_DEAD;

/// Everything the mock observed on the wire, at transaction granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEvent {
    DpRead(u8, u32),
    DpWrite(u8, u32),
    ApRead(u8, u8, u32),
    ApWrite(u8, u8, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    HeaderSent,
    AckPending,
    ReadData,
    ReadParity,
    WriteData,
    WriteParity,
}

#[derive(Debug, Clone, Copy)]
struct Request {
    ap: bool,
    read: bool,
    addr: u8,
}

/// The scripted line engine + target.
#[derive(Debug)]
pub struct MockLink {
    target: MockTarget,
    freq_khz: u32,
    parked: Arc<AtomicBool>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            target: MockTarget::new(),
            freq_khz: 1000,
            parked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that observes pin parking even after the link has been
    /// moved into (and dropped with) a session.
    pub fn park_probe(&self) -> Arc<AtomicBool> {
        self.parked.clone()
    }

    pub fn target(&self) -> &MockTarget {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut MockTarget {
        &mut self.target
    }

    pub fn log(&self) -> &[WireEvent] {
        &self.target.log
    }

    pub fn clear_log(&mut self) {
        self.target.log.clear();
    }

    /// DP SELECT writes observed since the last [`Self::clear_log`].
    pub fn select_writes(&self) -> usize {
        self.target
            .log
            .iter()
            .filter(|e| matches!(e, WireEvent::DpWrite(0x08, _)))
            .count()
    }
}

impl SwdIo for MockLink {
    async fn write_bits(&mut self, bits: u32, count: u8) {
        self.target.wire_write(bits, count);
    }

    async fn read_bits(&mut self, count: u8) -> u32 {
        self.target.wire_read(count)
    }

    async fn turnaround_in(&mut self) {
        if self.target.phase == Phase::HeaderSent {
            self.target.phase = Phase::AckPending;
        }
    }

    async fn turnaround_out(&mut self) {}

    async fn release(&mut self) {
        self.target.phase = Phase::Idle;
        self.parked.store(true, Ordering::Relaxed);
    }

    fn park(&mut self) {
        self.target.phase = Phase::Idle;
        self.target.request = None;
        self.parked.store(true, Ordering::Relaxed);
    }

    fn set_frequency(&mut self, khz: u32) -> Result<(), SwdError> {
        if !(crate::protocol::MIN_FREQUENCY_KHZ..=crate::protocol::MAX_FREQUENCY_KHZ)
            .contains(&khz)
        {
            return Err(SwdError::InvalidParam);
        }
        self.freq_khz = khz;
        Ok(())
    }

    fn frequency(&self) -> u32 {
        self.freq_khz
    }
}

/// Simulated SW-DP + RISC-V AP + Debug Module.
#[derive(Debug)]
pub struct MockTarget {
    // Wire-level state
    phase: Phase,
    request: Option<Request>,
    read_data: u32,
    corrupt_parity: bool,
    wait_count: u32,
    fault_next: bool,
    line_dead: bool,

    // DP state
    select: u32,
    ctrl_reqs: u32,
    sticky_err: bool,
    rdbuff: u32,

    // DTM / DMI port state
    dmi_req_lo: u32,
    dmi_op: Option<(u32, u32, u32)>, // (addr, data, op)
    dmi_executed: bool,
    dmi_resp: u32,
    dmi_busy_count: u32,
    dmi_fail_next: bool,
    dmi_fail_sticky: bool,

    pub dm: MockDm,
    log: Vec<WireEvent>,
}

impl MockTarget {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            request: None,
            read_data: 0,
            corrupt_parity: false,
            wait_count: 0,
            fault_next: false,
            line_dead: false,
            select: 0,
            ctrl_reqs: 0,
            sticky_err: false,
            rdbuff: STALE,
            dmi_req_lo: 0,
            dmi_op: None,
            dmi_executed: false,
            dmi_resp: 0,
            dmi_busy_count: 0,
            dmi_fail_next: false,
            dmi_fail_sticky: false,
            dm: MockDm::new(),
            log: Vec::new(),
        }
    }

    /// Both power-up requests acknowledged.
    pub fn powered_up(&self) -> bool {
        self.ctrl_reqs & (1 << 28) != 0 && self.ctrl_reqs & (1 << 30) != 0
    }

    pub fn sticky_err(&self) -> bool {
        self.sticky_err
    }

    /// Answer every ACK with all-ones, as an unconnected line would.
    pub fn set_line_dead(&mut self, dead: bool) {
        self.line_dead = dead;
    }

    /// WAIT-ACK the next `count` transactions.
    pub fn set_wait_count(&mut self, count: u32) {
        self.wait_count = count;
    }

    /// FAULT-ACK the next transaction and latch a sticky error.
    pub fn set_fault_next(&mut self) {
        self.fault_next = true;
    }

    /// Deliver the next read with a flipped parity bit.
    pub fn corrupt_next_read_parity(&mut self) {
        self.corrupt_parity = true;
    }

    /// Answer the next `count` DMI response polls with `busy`.
    pub fn set_dmi_busy_count(&mut self, count: u32) {
        self.dmi_busy_count = count;
    }

    /// Fail the next DMI operation (sticky until `dmireset`).
    pub fn set_dmi_fail_next(&mut self) {
        self.dmi_fail_next = true;
    }

    fn wire_write(&mut self, bits: u32, count: u8) {
        match (self.phase, count) {
            (Phase::Idle, 8) => {
                if Self::is_request_header(bits as u8) {
                    let byte = bits as u8;
                    self.request = Some(Request {
                        ap: byte & 0x02 != 0,
                        read: byte & 0x04 != 0,
                        addr: (byte >> 3) & 0x3,
                    });
                    self.phase = Phase::HeaderSent;
                }
                // Anything else (wake/activation bytes) is ignored
            }
            (Phase::WriteData, 32) => {
                self.read_data = bits; // stash the payload
                self.phase = Phase::WriteParity;
            }
            (Phase::WriteParity, 1) => {
                let payload = self.read_data;
                self.phase = Phase::Idle;
                if let Some(request) = self.request.take() {
                    self.commit_write(request, payload);
                }
            }
            _ => {
                // Reset/wake/idle padding clears any half-finished state
                if self.phase == Phase::HeaderSent {
                    self.phase = Phase::Idle;
                    self.request = None;
                }
            }
        }
    }

    fn wire_read(&mut self, count: u8) -> u32 {
        if self.line_dead {
            self.phase = Phase::Idle;
            self.request = None;
            return ((1u64 << count) - 1) as u32;
        }
        match (self.phase, count) {
            (Phase::AckPending, 3) => self.ack(),
            (Phase::ReadData, 32) => {
                self.phase = Phase::ReadParity;
                self.read_data
            }
            (Phase::ReadParity, 1) => {
                self.phase = Phase::Idle;
                let mut bit = parity(self.read_data);
                if self.corrupt_parity {
                    self.corrupt_parity = false;
                    bit = !bit;
                }
                bit as u32
            }
            _ => 0,
        }
    }

    fn ack(&mut self) -> u32 {
        if self.wait_count > 0 {
            self.wait_count -= 1;
            self.phase = Phase::Idle;
            self.request = None;
            return 0b010;
        }
        if self.fault_next {
            self.fault_next = false;
            self.sticky_err = true;
            self.phase = Phase::Idle;
            self.request = None;
            return 0b100;
        }

        let request = self.request.expect("ACK without a request");
        if request.read {
            self.read_data = self.commit_read(request);
            self.phase = Phase::ReadData;
            self.request = None;
        } else {
            self.phase = Phase::WriteData;
        }
        0b001
    }

    fn is_request_header(byte: u8) -> bool {
        if byte & 0x01 == 0 || byte & 0x40 != 0 || byte & 0x80 == 0 {
            return false;
        }
        let parity_bit = byte & 0x20 != 0;
        parity(byte & 0x1E) == parity_bit
    }

    fn commit_read(&mut self, request: Request) -> u32 {
        let addr = request.addr << 2;
        if request.ap {
            let apsel = (self.select >> 24) as u8;
            let full = ((self.select >> 4) & 0xF) as u8 * 0x10 + addr;
            // Posted: this access returns the previous result, the fresh
            // value parks in RDBUFF
            let fresh = self.ap_register_read(apsel, full);
            let stale = self.rdbuff;
            self.rdbuff = fresh;
            self.log.push(WireEvent::ApRead(apsel, full, fresh));
            stale
        } else {
            let value = match addr {
                0x00 => rp::RP2350_DPIDR,
                0x04 => self.ctrl_stat(),
                0x08 => self.select,
                0x0C => self.rdbuff,
                _ => 0,
            };
            self.log.push(WireEvent::DpRead(addr, value));
            value
        }
    }

    fn commit_write(&mut self, request: Request, value: u32) {
        let addr = request.addr << 2;
        if request.ap {
            let apsel = (self.select >> 24) as u8;
            let full = ((self.select >> 4) & 0xF) as u8 * 0x10 + addr;
            self.log.push(WireEvent::ApWrite(apsel, full, value));
            self.ap_register_write(apsel, full, value);
        } else {
            self.log.push(WireEvent::DpWrite(addr, value));
            match addr {
                0x00 => {
                    // ABORT: any clear bit drops the sticky error
                    if value & 0b11110 != 0 {
                        self.sticky_err = false;
                    }
                }
                0x04 => self.ctrl_reqs = value & ((1 << 28) | (1 << 30)),
                0x08 => self.select = value,
                _ => (),
            }
        }
    }

    fn ctrl_stat(&self) -> u32 {
        let mut value = self.ctrl_reqs;
        if self.ctrl_reqs & (1 << 28) != 0 {
            value |= 1 << 29;
        }
        if self.ctrl_reqs & (1 << 30) != 0 {
            value |= 1 << 31;
        }
        if self.sticky_err {
            value |= 1 << 5;
        }
        value
    }

    fn ap_register_read(&mut self, apsel: u8, addr: u8) -> u32 {
        if apsel != rp::RISCV_AP {
            return 0;
        }
        match addr {
            // dtmcs: version 1, abits 7, idle 1
            0x00 => (1 << 12) | (7 << 4) | 1,
            0x04 => self.dmi_lo_read(),
            0x08 => self.dmi_resp >> 30,
            _ => 0,
        }
    }

    fn ap_register_write(&mut self, apsel: u8, addr: u8, value: u32) {
        if apsel != rp::RISCV_AP {
            return;
        }
        match addr {
            0x00 => {
                // dtmcs.dmireset
                if value & (1 << 16) != 0 {
                    self.dmi_fail_sticky = false;
                }
            }
            0x04 => self.dmi_req_lo = value,
            0x08 => {
                let lo = self.dmi_req_lo;
                let addr = value >> 2;
                let data = (lo >> 2) | ((value & 0x3) << 30);
                let op = lo & 0x3;
                self.dmi_op = Some((addr, data, op));
                self.dmi_executed = false;
                self.dmi_resp = 0;
                if self.dmi_fail_next {
                    self.dmi_fail_next = false;
                    self.dmi_fail_sticky = true;
                }
            }
            _ => (),
        }
    }

    fn dmi_lo_read(&mut self) -> u32 {
        if self.dmi_fail_sticky {
            return 0b10;
        }
        if self.dmi_busy_count > 0 {
            self.dmi_busy_count -= 1;
            return 0b11;
        }
        if !self.dmi_executed {
            if let Some((addr, data, op)) = self.dmi_op {
                self.dmi_resp = match op {
                    1 => self.dm.register_read(addr),
                    2 => {
                        self.dm.register_write(addr, data);
                        0
                    }
                    _ => 0,
                };
            }
            self.dmi_executed = true;
        }
        self.dmi_resp << 2
    }
}

/// Simulated hart.
#[derive(Debug, Clone)]
pub struct MockHart {
    pub regs: [u32; 32],
    pub pc: u32,
    pub dpc: u32,
    pub dcsr: u32,
    pub halted: bool,
    pub resumeack: bool,
    pub havereset: bool,
    pub csrs: BTreeMap<u16, u32>,
}

impl MockHart {
    fn new() -> Self {
        Self {
            regs: [0; 32],
            pc: 0,
            dpc: 0,
            dcsr: 0,
            halted: false,
            resumeack: false,
            havereset: false,
            csrs: BTreeMap::new(),
        }
    }

    fn set_cause(&mut self, cause: u32) {
        self.dcsr = (self.dcsr & !(0x7 << 6)) | (cause << 6);
    }

    fn csr_read(&self, addr: u16) -> u32 {
        match addr {
            DPC => self.dpc,
            DCSR => self.dcsr,
            _ => *self.csrs.get(&addr).unwrap_or(&0),
        }
    }

    fn csr_write(&mut self, addr: u16, value: u32, ignore_dpc: bool) {
        match addr {
            DPC => {
                if !ignore_dpc {
                    self.dpc = value;
                }
            }
            DCSR => self.dcsr = value,
            _ => {
                self.csrs.insert(addr, value);
            }
        }
    }
}

/// Simulated 0.13 Debug Module with two harts and SRAM behind SBA.
#[derive(Debug)]
pub struct MockDm {
    pub dmactive: bool,
    pub harts: [MockHart; 2],
    hartsel: u32,

    data0: u32,
    progbuf: [u32; 2],
    cmderr: u32,

    sbcs_ctl: u32,
    sbaddress: u32,
    sbdata_latch: u32,
    sberror: u32,

    mem: BTreeMap<u32, u32>,

    /// Fault injection: refuse abstract access to CSRs.
    pub abstract_csrs_unsupported: bool,
    /// Fault injection: drop `dpc` writes on the floor.
    pub ignore_dpc_writes: bool,

    /// Abstract commands executed so far.
    pub abstract_commands: u32,
    /// Program buffer executions so far.
    pub progbuf_executions: u32,
    /// SBA transfers so far.
    pub sba_accesses: u32,
}

impl MockDm {
    fn new() -> Self {
        Self {
            dmactive: false,
            harts: [MockHart::new(), MockHart::new()],
            hartsel: 0,
            data0: 0,
            progbuf: [0; 2],
            cmderr: 0,
            sbcs_ctl: 0,
            sbaddress: 0,
            sbdata_latch: 0,
            sberror: 0,
            mem: BTreeMap::new(),
            abstract_csrs_unsupported: false,
            ignore_dpc_writes: false,
            abstract_commands: 0,
            progbuf_executions: 0,
            sba_accesses: 0,
        }
    }

    /// Stage a word in target memory.
    pub fn write_mem(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr, value);
    }

    /// Read a word of target memory.
    pub fn read_mem(&self, addr: u32) -> u32 {
        *self.mem.get(&addr).unwrap_or(&0)
    }

    fn hart(&mut self) -> &mut MockHart {
        &mut self.harts[(self.hartsel & 1) as usize]
    }

    fn register_read(&mut self, addr: u32) -> u32 {
        match addr {
            0x04 => self.data0,
            0x10 => {
                // haltreq/resumereq read back as zero
                let mut value = self.dmactive as u32;
                value |= (self.hartsel & 0x3FF) << 16;
                value
            }
            0x11 => self.dmstatus(),
            0x12 => 1 << 20, // nscratch = 1
            0x16 => (2 << 24) | (self.cmderr << 8) | 1,
            0x20 => self.progbuf[0],
            0x21 => self.progbuf[1],
            0x38 => (1 << 29) | self.sbcs_ctl | (self.sberror << 12) | (32 << 5) | (1 << 2),
            0x39 => self.sbaddress,
            0x3C => self.sbdata0_read(),
            _ => 0,
        }
    }

    fn register_write(&mut self, addr: u32, value: u32) {
        match addr {
            0x04 => self.data0 = value,
            0x10 => self.dmcontrol_write(value),
            0x16 => self.cmderr &= !((value >> 8) & 0x7),
            0x17 => self.command_write(value),
            0x20 => self.progbuf[0] = value,
            0x21 => self.progbuf[1] = value,
            0x38 => {
                self.sberror &= !((value >> 12) & 0x7);
                self.sbcs_ctl = value & ((1 << 20) | (1 << 16) | (1 << 15) | (0x7 << 17));
            }
            0x39 => {
                self.sbaddress = value;
                if self.sbcs_ctl & (1 << 20) != 0 {
                    self.sba_read_at_address();
                }
            }
            0x3C => self.sbdata0_write(value),
            _ => (),
        }
    }

    fn dmstatus(&self) -> u32 {
        let hart = &self.harts[(self.hartsel & 1) as usize];
        let mut value = 2; // version 0.13
        value |= 1 << 22; // impebreak
        value |= 1 << 7; // authenticated
        if hart.havereset {
            value |= (1 << 19) | (1 << 18);
        }
        if hart.resumeack {
            value |= (1 << 17) | (1 << 16);
        }
        if hart.halted {
            value |= (1 << 9) | (1 << 8);
        } else {
            value |= (1 << 11) | (1 << 10);
        }
        value
    }

    fn dmcontrol_write(&mut self, value: u32) {
        self.dmactive = value & 1 != 0;
        if !self.dmactive {
            return;
        }
        self.hartsel = (value >> 16) & 0x3FF;

        let haltreq = value & (1 << 31) != 0;
        let resumereq = value & (1 << 30) != 0;
        let ndmreset = value & (1 << 1) != 0;
        let ackhavereset = value & (1 << 28) != 0;

        if ackhavereset {
            for hart in self.harts.iter_mut() {
                hart.havereset = false;
            }
        }

        if ndmreset {
            // Everything outside the DM resets
            for hart in self.harts.iter_mut() {
                *hart = MockHart::new();
                hart.pc = rp::ROM_BASE;
                hart.dpc = rp::ROM_BASE;
                hart.havereset = true;
            }
        }

        if haltreq {
            let hart = self.hart();
            if !hart.halted {
                hart.halted = true;
                hart.resumeack = false;
                hart.dpc = hart.pc;
                let cause = if hart.havereset { 5 } else { 3 };
                hart.set_cause(cause);
            }
        }

        if resumereq {
            let stepping = self.hart().dcsr & (1 << 2) != 0;
            if self.hart().halted {
                if stepping {
                    self.step_hart();
                } else {
                    let hart = self.hart();
                    hart.halted = false;
                    hart.pc = hart.dpc;
                    hart.resumeack = true;
                }
            }
        }
    }

    fn command_write(&mut self, value: u32) {
        if self.cmderr != 0 {
            return;
        }
        self.abstract_commands += 1;

        let cmdtype = value >> 24;
        let aarsize = (value >> 20) & 0x7;
        let postexec = value & (1 << 18) != 0;
        let transfer = value & (1 << 17) != 0;
        let write = value & (1 << 16) != 0;
        let regno = (value & 0xFFFF) as u16;

        if cmdtype != 0 || (transfer && aarsize != 2) {
            self.cmderr = 2;
            return;
        }

        if (transfer || postexec) && !self.hart().halted {
            self.cmderr = 4;
            return;
        }

        if transfer {
            if (0x1000..0x1020).contains(&regno) {
                let index = (regno - 0x1000) as usize;
                if write {
                    if index != 0 {
                        let data0 = self.data0;
                        self.hart().regs[index] = data0;
                    }
                } else {
                    self.data0 = self.hart().regs[index];
                }
            } else if regno < 0x1000 {
                if self.abstract_csrs_unsupported {
                    self.cmderr = 2;
                    return;
                }
                if write {
                    let (data0, ignore_dpc) = (self.data0, self.ignore_dpc_writes);
                    self.hart().csr_write(regno, data0, ignore_dpc);
                } else {
                    self.data0 = self.hart().csr_read(regno);
                }
            } else {
                self.cmderr = 2;
                return;
            }
        }

        if postexec {
            self.execute_progbuf();
        }
    }

    fn execute_progbuf(&mut self) {
        self.progbuf_executions += 1;
        for index in 0..self.progbuf.len() {
            let insn = self.progbuf[index];
            if insn == EBREAK {
                break;
            }
            if self.execute_insn(insn).is_none() {
                break;
            }
        }
    }

    // Advance the selected (halted, stepping) hart by one instruction.
    fn step_hart(&mut self) {
        let dpc = self.hart().dpc;
        let insn = self.read_mem(dpc);
        let next = match self.execute_insn(insn) {
            Some(Some(jump)) => dpc.wrapping_add(jump as u32),
            _ => dpc.wrapping_add(4),
        };
        let hart = self.hart();
        hart.dpc = next;
        hart.pc = next;
        hart.resumeack = true;
        hart.halted = true;
        hart.set_cause(4);
    }

    // Execute one RV32I instruction against the selected hart.  Returns
    // None for ebreak/unknown, Some(None) for straight-line, Some(offset)
    // for a taken jump.
    fn execute_insn(&mut self, insn: u32) -> Option<Option<i32>> {
        if insn == EBREAK {
            return None;
        }
        let opcode = insn & 0x7F;
        let rd = ((insn >> 7) & 0x1F) as usize;
        let funct3 = (insn >> 12) & 0x7;
        let rs1 = ((insn >> 15) & 0x1F) as usize;
        let rs2 = ((insn >> 20) & 0x1F) as usize;
        let imm_i = (insn as i32) >> 20;

        match opcode {
            // addi
            0x13 => {
                let value = self.hart().regs[rs1].wrapping_add(imm_i as u32);
                if rd != 0 {
                    self.hart().regs[rd] = value;
                }
                Some(None)
            }
            // lw
            0x03 => {
                let addr = self.hart().regs[rs1].wrapping_add(imm_i as u32);
                let value = self.read_mem(addr);
                if rd != 0 {
                    self.hart().regs[rd] = value;
                }
                Some(None)
            }
            // sw
            0x23 => {
                let imm = ((insn as i32 >> 25) << 5) | (((insn >> 7) & 0x1F) as i32);
                let addr = self.hart().regs[rs1].wrapping_add(imm as u32);
                let value = self.hart().regs[rs2];
                self.mem.insert(addr, value);
                Some(None)
            }
            // csrrw / csrrs
            0x73 => {
                let csr = (insn >> 20) as u16;
                let old = self.hart().csr_read(csr);
                let rs1_value = self.hart().regs[rs1];
                match funct3 {
                    1 => {
                        let ignore_dpc = self.ignore_dpc_writes;
                        self.hart().csr_write(csr, rs1_value, ignore_dpc);
                    }
                    2 => {
                        if rs1 != 0 {
                            let ignore_dpc = self.ignore_dpc_writes;
                            self.hart().csr_write(csr, old | rs1_value, ignore_dpc);
                        }
                    }
                    _ => return None,
                }
                if rd != 0 {
                    self.hart().regs[rd] = old;
                }
                Some(None)
            }
            // jal
            0x6F => {
                let imm20 = (insn >> 31) & 1;
                let imm10_1 = (insn >> 21) & 0x3FF;
                let imm11 = (insn >> 20) & 1;
                let imm19_12 = (insn >> 12) & 0xFF;
                let raw = (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1);
                // Sign-extend from bit 20
                let offset = ((raw << 11) as i32) >> 11;
                if rd != 0 {
                    let dpc = self.hart().dpc;
                    self.hart().regs[rd] = dpc.wrapping_add(4);
                }
                Some(Some(offset))
            }
            _ => None,
        }
    }

    fn sba_address_valid(&self) -> bool {
        (rp::SRAM_BASE..rp::SRAM_END).contains(&self.sbaddress)
    }

    fn sba_read_at_address(&mut self) {
        self.sba_accesses += 1;
        if !self.sba_address_valid() {
            self.sberror = 2;
            return;
        }
        self.sbdata_latch = self.read_mem(self.sbaddress);
        if self.sbcs_ctl & (1 << 16) != 0 {
            self.sbaddress = self.sbaddress.wrapping_add(4);
        }
    }

    fn sbdata0_read(&mut self) -> u32 {
        let value = self.sbdata_latch;
        if self.sbcs_ctl & (1 << 15) != 0 && self.sberror == 0 {
            self.sba_read_at_address();
        }
        value
    }

    fn sbdata0_write(&mut self, value: u32) {
        self.sba_accesses += 1;
        if !self.sba_address_valid() {
            self.sberror = 2;
            return;
        }
        self.mem.insert(self.sbaddress, value);
        if self.sbcs_ctl & (1 << 16) != 0 {
            self.sbaddress = self.sbaddress.wrapping_add(4);
        }
    }
}
