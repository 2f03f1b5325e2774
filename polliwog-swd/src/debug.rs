// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! RISC-V Debug Module driver.
//!
//! [`DebugModule`] drives the RP2350's Hazard3 Debug Module over
//! [`crate::dmi`]: hart selection and halt/resume/step/reset, abstract
//! commands, the program buffer, System Bus Access, and GPR/CSR/memory
//! accessors.  The instruction-tracing loop built on top of these lives in
//! [`crate::trace`].
//!
//! Per-hart state is tracked as the pair `halted`/`halt_known`: any resume
//! or reset falsifies the knowledge, an explicit status read re-establishes
//! it.  The optional GPR snapshot cache rides on top and is
//! an optimisation only - it is falsified by anything that can change a
//! register.

use embassy_time::{Duration, Instant, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use polliwog_core::riscv::dm::{
    Abstractcs, AccessRegisterCommand, Command, Data0, Dcsr, DmRegister, Dmcontrol, Dmstatus,
    Hartinfo, Progbuf0, Progbuf1, Progbuf2, Progbuf3, Sbaddress0, Sbcs, Sbdata0,
};
use polliwog_core::riscv::{S0, S1, asm, csr, gpr_regno};
use polliwog_core::rp;

use crate::dmi::DmiTransport;
use crate::protocol::SwdIo;
use crate::{AbstractCmdError, BusError, SwdError};

// Poll budgets.  Every blocking loop in this module is bounded.
const DM_TIMEOUT: Duration = Duration::from_millis(500);
const DM_POLL: Duration = Duration::from_micros(100);

// Hold time for the reset request before release.
const RESET_SETTLE: Duration = Duration::from_millis(1);

// Program buffer words this driver can address (Hazard3 implements 2).
const PROGBUF_MAX: usize = 4;

/// Why a hart is halted, from `dcsr.cause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HaltReason {
    /// An `ebreak` instruction.
    Ebreak,
    /// The trigger module.
    Trigger,
    /// A debugger halt request.
    Request,
    /// Completion of a single step.
    Step,
    /// Halt-on-reset.
    ResetHalt,
    Unknown,
}

impl HaltReason {
    fn from_cause(cause: u32) -> Self {
        match cause {
            1 => HaltReason::Ebreak,
            2 => HaltReason::Trigger,
            3 => HaltReason::Request,
            4 => HaltReason::Step,
            5 => HaltReason::ResetHalt,
            _ => HaltReason::Unknown,
        }
    }
}

/// Memory access routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemRoute {
    /// Prefer SBA when the DM supports it, fall back to the program buffer
    /// when the selected hart is known-halted.  Never halts a running hart.
    #[default]
    Auto,
    /// System Bus Access - non-intrusive, works with the hart running.
    SystemBus,
    /// Hart-mediated access through the program buffer.  Requires the
    /// selected hart halted.
    ProgramBuffer,
}

#[derive(Debug, Clone, Copy)]
struct HartState {
    halted: bool,
    halt_known: bool,
    gprs: [u32; 32],
    gpr_cache_valid: bool,
}

impl HartState {
    const fn new() -> Self {
        Self {
            halted: false,
            halt_known: false,
            gprs: [0; 32],
            gpr_cache_valid: false,
        }
    }

    // Anything that lets the hart run (or rewrites its registers) lands
    // here.  cache_valid implies halted && halt_known, so both fall
    // together.
    fn invalidate(&mut self) {
        self.halt_known = false;
        self.gpr_cache_valid = false;
    }
}

/// Debug Module driver for the RP2350's two RISC-V harts.
#[derive(Debug)]
pub struct DebugModule<IO: SwdIo> {
    dmi: DmiTransport<IO>,
    initialized: bool,
    hartsel: u8,
    harts: [HartState; rp::NUM_HARTS as usize],
    progbuf_size: u8,
    progbuf_cache: [u32; PROGBUF_MAX],
    progbuf_cache_len: usize,
    data_count: u8,
    impebreak: bool,
    nscratch: u8,
    sba_supported: bool,
    sbasize: u8,
    gpr_cache_enabled: bool,
}

impl<IO: SwdIo> DebugModule<IO> {
    pub fn new(dmi: DmiTransport<IO>) -> Self {
        Self {
            dmi,
            initialized: false,
            hartsel: 0,
            harts: [HartState::new(); rp::NUM_HARTS as usize],
            progbuf_size: 0,
            progbuf_cache: [0; PROGBUF_MAX],
            progbuf_cache_len: 0,
            data_count: 0,
            impebreak: false,
            nscratch: 0,
            sba_supported: false,
            sbasize: 0,
            gpr_cache_enabled: true,
        }
    }

    /// The DMI transport underneath, for connection management.
    pub fn dmi(&mut self) -> &mut DmiTransport<IO> {
        &mut self.dmi
    }

    /// Enable or disable the per-hart GPR snapshot cache.  Correctness
    /// never depends on it.
    pub fn set_gpr_cache_enabled(&mut self, enabled: bool) {
        self.gpr_cache_enabled = enabled;
        if !enabled {
            for hart in self.harts.iter_mut() {
                hart.gpr_cache_valid = false;
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Activate the Debug Module and discover its shape: DMI address
    /// width, program buffer size, data registers, SBA support.
    pub async fn init(&mut self) -> Result<(), SwdError> {
        trace!("Exec:  DM init");
        self.initialized = false;
        self.dmi.init().await?;

        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        self.write_dm(control).await?;

        // The module is up once the selected hart reports a definite state
        let deadline = Instant::now() + DM_TIMEOUT;
        let status = loop {
            let status: Dmstatus = self.read_dm().await?;
            if status.responsive() {
                break status;
            }
            if Instant::now() >= deadline {
                warn!("Debug Module unresponsive, dmstatus {status:?}");
                return Err(SwdError::Timeout);
            }
            Timer::after(DM_POLL).await;
        };

        // Only 0.13 is supported
        if status.version() != 2 {
            warn!("Unsupported Debug Module version {}", status.version());
            return Err(SwdError::Protocol);
        }
        self.impebreak = status.impebreak();

        let abstractcs: Abstractcs = self.read_dm().await?;
        self.progbuf_size = (abstractcs.progbufsize() as usize).min(PROGBUF_MAX) as u8;
        self.data_count = abstractcs.datacount() as u8;

        let hartinfo: Hartinfo = self.read_dm().await?;
        self.nscratch = hartinfo.nscratch() as u8;

        let sbcs: Sbcs = self.read_dm().await?;
        self.sbasize = sbcs.sbasize() as u8;
        self.sba_supported = sbcs.sbversion() == 1 && sbcs.sbaccess32();

        debug!(
            "Value: DM abits={} progbuf={} datacount={} impebreak={} nscratch={} sba32={} sbasize={}",
            self.dmi.abits(),
            self.progbuf_size,
            self.data_count,
            self.impebreak,
            self.nscratch,
            self.sba_supported,
            self.sbasize
        );

        self.hartsel = 0;
        self.harts = [HartState::new(); rp::NUM_HARTS as usize];
        self.progbuf_cache_len = 0;
        self.initialized = true;
        Ok(())
    }

    /// Route subsequent per-hart operations to `hart`.
    pub async fn select_hart(&mut self, hart: u8) -> Result<(), SwdError> {
        if hart >= rp::NUM_HARTS {
            return Err(SwdError::InvalidParam);
        }
        if self.hartsel != hart {
            let control = self.control_base_for(hart);
            self.write_dm(control).await?;
            self.hartsel = hart;
        }
        Ok(())
    }

    /// Currently selected hart.
    pub fn selected_hart(&self) -> u8 {
        self.hartsel
    }

    /// Halt a hart.  Returns `AlreadyHalted` (benign) if it was not
    /// running.
    pub async fn halt(&mut self, hart: u8) -> Result<(), SwdError> {
        self.require_init()?;
        self.select_hart(hart).await?;

        let status: Dmstatus = self.read_dm().await?;
        if status.allhalted() {
            self.harts[hart as usize].halted = true;
            self.harts[hart as usize].halt_known = true;
            return Err(SwdError::AlreadyHalted);
        }

        trace!("Exec:  Halt hart {hart}");
        let mut control = self.control_base();
        control.set_haltreq(true);
        self.write_dm(control).await?;

        let result = self.poll_dmstatus(|s| s.allhalted()).await;

        // Always drop the halt request, even on timeout
        self.write_dm(self.control_base()).await?;
        result?;

        self.harts[hart as usize].halted = true;
        self.harts[hart as usize].halt_known = true;
        debug!("OK:    Hart {hart} halted");
        Ok(())
    }

    /// Resume a halted hart.
    pub async fn resume(&mut self, hart: u8) -> Result<(), SwdError> {
        self.require_init()?;
        self.require_halted(hart).await?;

        trace!("Exec:  Resume hart {hart}");
        self.resume_request().await?;

        // The hart is running; our knowledge of its state ends here
        self.harts[hart as usize].halted = false;
        self.harts[hart as usize].invalidate();
        debug!("OK:    Hart {hart} resumed");
        Ok(())
    }

    /// Single-step a halted hart: one instruction retires, then the hart
    /// halts again.
    pub async fn step(&mut self, hart: u8) -> Result<(), SwdError> {
        self.require_init()?;
        self.require_halted(hart).await?;

        trace!("Exec:  Step hart {hart}");
        let mut dcsr = Dcsr(self.csr_read_inner(csr::DCSR).await?);
        dcsr.set_step(true);
        self.csr_write_inner(csr::DCSR, dcsr.0).await?;

        self.resume_request().await?;
        self.poll_dmstatus(|s| s.allhalted()).await?;

        let mut dcsr = Dcsr(self.csr_read_inner(csr::DCSR).await?);
        dcsr.set_step(false);
        self.csr_write_inner(csr::DCSR, dcsr.0).await?;

        let hart_state = &mut self.harts[hart as usize];
        hart_state.halted = true;
        hart_state.halt_known = true;
        hart_state.gpr_cache_valid = false;
        Ok(())
    }

    /// Reset a hart.  Uses `hartreset` when the DM implements it, else
    /// `ndmreset` (which resets everything outside the DM - both harts').
    /// With `halt_after`, the halt request is held across the release so
    /// the hart halts at its reset vector.
    pub async fn reset(&mut self, hart: u8, halt_after: bool) -> Result<(), SwdError> {
        self.require_init()?;
        self.select_hart(hart).await?;

        trace!("Exec:  Reset hart {hart} halt_after={halt_after}");
        let mut control = self.control_base();
        control.set_hartreset(true);
        if halt_after {
            control.set_haltreq(true);
        }
        self.write_dm(control).await?;

        // Readback proves whether hartreset is implemented
        let readback: Dmcontrol = self.read_dm().await?;
        let per_hart = readback.hartreset();
        if !per_hart {
            debug!("hartreset not supported, using ndmreset");
            let mut control = self.control_base();
            control.set_ndmreset(true);
            if halt_after {
                control.set_haltreq(true);
            }
            self.write_dm(control).await?;
        }

        Timer::after(RESET_SETTLE).await;

        // Release reset; keep the halt request pending if asked for
        let mut release = self.control_base();
        if halt_after {
            release.set_haltreq(true);
        }
        self.write_dm(release).await?;

        self.poll_dmstatus(|s| {
            s.allhavereset() && if halt_after { s.allhalted() } else { s.responsive() }
        })
        .await?;

        // Acknowledge the reset and drop the halt request
        let mut ack = self.control_base();
        ack.set_ackhavereset(true);
        self.write_dm(ack).await?;

        if per_hart {
            self.harts[hart as usize].invalidate();
        } else {
            for hart_state in self.harts.iter_mut() {
                hart_state.invalidate();
            }
        }
        let hart_state = &mut self.harts[hart as usize];
        hart_state.halted = halt_after;
        hart_state.halt_known = halt_after;

        debug!("OK:    Hart {hart} reset");
        Ok(())
    }

    /// Whether a hart is halted, from a fresh status read.
    pub async fn is_halted(&mut self, hart: u8) -> Result<bool, SwdError> {
        self.require_init()?;
        self.select_hart(hart).await?;

        let status: Dmstatus = self.read_dm().await?;
        let hart_state = &mut self.harts[hart as usize];
        hart_state.halted = status.allhalted();
        hart_state.halt_known = true;
        Ok(hart_state.halted)
    }

    /// Why the hart last halted.
    pub async fn halt_reason(&mut self, hart: u8) -> Result<HaltReason, SwdError> {
        self.require_init()?;
        self.require_halted(hart).await?;

        let dcsr = Dcsr(self.csr_read_inner(csr::DCSR).await?);
        Ok(HaltReason::from_cause(dcsr.cause()))
    }

    /// Read GPR `regno` (0..=31).  `x0` is hard-wired zero and answered
    /// without a bus transaction.
    pub async fn read_reg(&mut self, hart: u8, regno: u8) -> Result<u32, SwdError> {
        self.require_init()?;
        if regno >= 32 {
            return Err(SwdError::InvalidParam);
        }
        if regno == 0 {
            return Ok(0);
        }
        self.require_halted(hart).await?;
        self.abstract_reg_read(gpr_regno(regno)).await
    }

    /// Write GPR `regno` (0..=31).  Writes to `x0` silently succeed.
    pub async fn write_reg(&mut self, hart: u8, regno: u8, value: u32) -> Result<(), SwdError> {
        self.require_init()?;
        if regno >= 32 {
            return Err(SwdError::InvalidParam);
        }
        if regno == 0 {
            return Ok(());
        }
        self.require_halted(hart).await?;
        self.abstract_reg_write(gpr_regno(regno), value).await?;
        self.harts[hart as usize].gpr_cache_valid = false;
        Ok(())
    }

    /// Snapshot all 32 GPRs into `buf`.  Served from the cache when it is
    /// valid and enabled.
    pub async fn read_all_gprs(&mut self, hart: u8, buf: &mut [u32; 32]) -> Result<(), SwdError> {
        self.require_init()?;
        self.require_halted(hart).await?;

        if self.gpr_cache_enabled && self.harts[hart as usize].gpr_cache_valid {
            *buf = self.harts[hart as usize].gprs;
            return Ok(());
        }

        buf[0] = 0;
        for regno in 1..32u8 {
            buf[regno as usize] = self.abstract_reg_read(gpr_regno(regno)).await?;
        }

        if self.gpr_cache_enabled {
            let hart_state = &mut self.harts[hart as usize];
            hart_state.gprs = *buf;
            hart_state.gpr_cache_valid = true;
        }
        Ok(())
    }

    /// Read a CSR.  Tries the abstract command, falls back to the program
    /// buffer when the DM does not support direct CSR access.
    pub async fn read_csr(&mut self, hart: u8, address: u16) -> Result<u32, SwdError> {
        self.require_init()?;
        if address > csr::MAX {
            return Err(SwdError::InvalidParam);
        }
        self.require_halted(hart).await?;
        self.csr_read_inner(address).await
    }

    /// Write a CSR, with the same fallback as [`Self::read_csr`].
    pub async fn write_csr(&mut self, hart: u8, address: u16, value: u32) -> Result<(), SwdError> {
        self.require_init()?;
        if address > csr::MAX {
            return Err(SwdError::InvalidParam);
        }
        self.require_halted(hart).await?;
        self.csr_write_inner(address, value).await
    }

    /// Read the hart's PC (the `dpc` CSR).
    pub async fn read_pc(&mut self, hart: u8) -> Result<u32, SwdError> {
        self.read_csr(hart, csr::DPC).await
    }

    /// Write the hart's PC (the `dpc` CSR).  Debug builds verify by
    /// read-back; a mismatch is [`SwdError::Verify`].
    pub async fn write_pc(&mut self, hart: u8, pc: u32) -> Result<(), SwdError> {
        self.write_csr(hart, csr::DPC, pc).await?;

        #[cfg(debug_assertions)]
        {
            let read_back = self.read_csr(hart, csr::DPC).await?;
            if read_back != pc {
                warn!("dpc read-back 0x{read_back:08X} after writing 0x{pc:08X}");
                return Err(SwdError::Verify);
            }
        }
        Ok(())
    }

    /// Read a 32-bit word from target memory, routing per
    /// [`MemRoute::Auto`].
    pub async fn read_mem32(&mut self, addr: u32) -> Result<u32, SwdError> {
        self.read_mem32_via(addr, MemRoute::Auto).await
    }

    /// Write a 32-bit word to target memory, routing per
    /// [`MemRoute::Auto`].
    pub async fn write_mem32(&mut self, addr: u32, value: u32) -> Result<(), SwdError> {
        self.write_mem32_via(addr, value, MemRoute::Auto).await
    }

    /// Read a 32-bit word via an explicit route.
    pub async fn read_mem32_via(&mut self, addr: u32, route: MemRoute) -> Result<u32, SwdError> {
        self.require_init()?;
        check_alignment(addr)?;
        if self.route_is_sba(route)? {
            self.sba_read32(addr).await
        } else {
            self.progbuf_read32(addr).await
        }
    }

    /// Write a 32-bit word via an explicit route.
    pub async fn write_mem32_via(
        &mut self,
        addr: u32,
        value: u32,
        route: MemRoute,
    ) -> Result<(), SwdError> {
        self.require_init()?;
        check_alignment(addr)?;
        if self.route_is_sba(route)? {
            self.sba_write32(addr, value).await
        } else {
            self.progbuf_write32(addr, value).await
        }
    }

    /// Bulk word read over SBA auto-increment.
    pub async fn read_mem32_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), SwdError> {
        self.require_init()?;
        check_alignment(addr)?;
        if !self.sba_supported {
            return Err(SwdError::InvalidState);
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.sba_read32_bulk(addr, buf).await
    }

    /// Bulk word write over SBA auto-increment.
    pub async fn write_mem32_bulk(&mut self, addr: u32, data: &[u32]) -> Result<(), SwdError> {
        self.require_init()?;
        check_alignment(addr)?;
        if !self.sba_supported {
            return Err(SwdError::InvalidState);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.sba_write32_bulk(addr, data).await
    }

    // A disconnect invalidates everything discovered at init.
    pub(crate) fn mark_uninitialized(&mut self) {
        self.initialized = false;
    }

    pub(crate) fn require_init(&self) -> Result<(), SwdError> {
        if self.initialized {
            Ok(())
        } else {
            Err(SwdError::NotInitialized)
        }
    }

    /// Error unless the hart is known-halted (reads status if unknown).
    pub(crate) async fn require_halted(&mut self, hart: u8) -> Result<(), SwdError> {
        self.select_hart(hart).await?;
        if !self.harts[hart as usize].halt_known {
            let status: Dmstatus = self.read_dm().await?;
            self.harts[hart as usize].halted = status.allhalted();
            self.harts[hart as usize].halt_known = true;
        }
        if self.harts[hart as usize].halted {
            Ok(())
        } else {
            Err(SwdError::NotHalted)
        }
    }
}

// Internal: DM register plumbing, abstract commands, program buffer, SBA
impl<IO: SwdIo> DebugModule<IO> {
    async fn read_dm<R: DmRegister>(&mut self) -> Result<R, SwdError> {
        let raw = self.dmi.read(R::ADDR as u32).await?;
        Ok(R::from(raw))
    }

    async fn write_dm<R: DmRegister>(&mut self, value: R) -> Result<(), SwdError> {
        self.dmi.write(R::ADDR as u32, value.into()).await
    }

    // dmcontrol with dmactive and the current hart selection - the base
    // every control write starts from.
    fn control_base(&self) -> Dmcontrol {
        self.control_base_for(self.hartsel)
    }

    fn control_base_for(&self, hart: u8) -> Dmcontrol {
        let mut control = Dmcontrol(0);
        control.set_dmactive(true);
        control.set_hartsel(hart as u32);
        control
    }

    async fn poll_dmstatus(
        &mut self,
        done: impl Fn(&Dmstatus) -> bool,
    ) -> Result<(), SwdError> {
        let deadline = Instant::now() + DM_TIMEOUT;
        loop {
            let status: Dmstatus = self.read_dm().await?;
            if done(&status) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!("Error: dmstatus poll timed out ({status:?})");
                return Err(SwdError::Timeout);
            }
            Timer::after(DM_POLL).await;
        }
    }

    async fn resume_request(&mut self) -> Result<(), SwdError> {
        let mut control = self.control_base();
        control.set_resumereq(true);
        self.write_dm(control).await?;

        let result = self.poll_dmstatus(|s| s.allresumeack()).await;

        // Drop the request either way
        self.write_dm(self.control_base()).await?;
        result
    }

    async fn execute_abstract(&mut self, command: AccessRegisterCommand) -> Result<(), SwdError> {
        // Clear any stale command error first
        self.write_dm(Abstractcs::clear_cmderr()).await?;
        self.write_dm(Command(command.0)).await?;

        let deadline = Instant::now() + DM_TIMEOUT;
        let status = loop {
            let status: Abstractcs = self.read_dm().await?;
            if !status.busy() {
                break status;
            }
            if Instant::now() >= deadline {
                debug!("Error: abstract command stuck busy");
                return Err(SwdError::Timeout);
            }
            Timer::after(DM_POLL).await;
        };

        if status.cmderr() != 0 {
            let kind = AbstractCmdError::parse(status.cmderr() as u8);
            self.write_dm(Abstractcs::clear_cmderr()).await?;
            debug!("Error: abstract command 0x{:08X}: {kind:?}", command.0);
            return Err(SwdError::AbstractCmd(kind));
        }
        Ok(())
    }

    async fn abstract_reg_read(&mut self, regno: u16) -> Result<u32, SwdError> {
        let mut command = AccessRegisterCommand(0);
        command.set_cmdtype(0);
        command.set_transfer(true);
        command.set_aarsize(AccessRegisterCommand::AARSIZE_32);
        command.set_regno(regno as u32);
        self.execute_abstract(command).await?;

        let data: Data0 = self.read_dm().await?;
        Ok(data.0)
    }

    async fn abstract_reg_write(&mut self, regno: u16, value: u32) -> Result<(), SwdError> {
        self.write_dm(Data0(value)).await?;

        let mut command = AccessRegisterCommand(0);
        command.set_cmdtype(0);
        command.set_transfer(true);
        command.set_write(true);
        command.set_aarsize(AccessRegisterCommand::AARSIZE_32);
        command.set_regno(regno as u32);
        self.execute_abstract(command).await
    }

    async fn csr_read_inner(&mut self, address: u16) -> Result<u32, SwdError> {
        match self.abstract_reg_read(address).await {
            Err(SwdError::AbstractCmd(AbstractCmdError::NotSupported)) => {
                debug!("CSR 0x{address:03X} not abstract-readable, using program buffer");
                self.csr_read_progbuf(address).await
            }
            other => other,
        }
    }

    async fn csr_write_inner(&mut self, address: u16, value: u32) -> Result<(), SwdError> {
        match self.abstract_reg_write(address, value).await {
            Err(SwdError::AbstractCmd(AbstractCmdError::NotSupported)) => {
                debug!("CSR 0x{address:03X} not abstract-writable, using program buffer");
                self.csr_write_progbuf(address, value).await
            }
            other => other,
        }
    }

    async fn csr_read_progbuf(&mut self, address: u16) -> Result<u32, SwdError> {
        let s0 = self.abstract_reg_read(gpr_regno(S0)).await?;

        self.setup_progbuf(&[asm::csrr(S0, address)]).await?;
        let mut command = AccessRegisterCommand(0);
        command.set_postexec(true);
        self.execute_abstract(command).await?;

        let value = self.abstract_reg_read(gpr_regno(S0)).await?;

        self.abstract_reg_write(gpr_regno(S0), s0).await?;
        Ok(value)
    }

    async fn csr_write_progbuf(&mut self, address: u16, value: u32) -> Result<(), SwdError> {
        let s0 = self.abstract_reg_read(gpr_regno(S0)).await?;

        self.setup_progbuf(&[asm::csrw(address, S0)]).await?;

        // Transfer the value into s0, then execute the snippet
        self.write_dm(Data0(value)).await?;
        let mut command = AccessRegisterCommand(0);
        command.set_transfer(true);
        command.set_write(true);
        command.set_aarsize(AccessRegisterCommand::AARSIZE_32);
        command.set_regno(gpr_regno(S0) as u32);
        command.set_postexec(true);
        self.execute_abstract(command).await?;

        self.abstract_reg_write(gpr_regno(S0), s0).await?;
        Ok(())
    }

    // Upload a snippet, appending the terminating ebreak unless the DM's
    // implicit one covers it.  Skips the upload when the buffer already
    // holds this snippet.
    async fn setup_progbuf(&mut self, program: &[u32]) -> Result<(), SwdError> {
        let required = if self.impebreak {
            program.len()
        } else {
            program.len() + 1
        };
        if required > self.progbuf_size as usize {
            debug!("Snippet of {} words exceeds program buffer", program.len());
            return Err(SwdError::InvalidState);
        }

        if program.len() == self.progbuf_cache_len
            && program == &self.progbuf_cache[..program.len()]
        {
            trace!("Program buffer is up to date");
            return Ok(());
        }

        for (index, word) in program.iter().enumerate() {
            self.write_progbuf(index, *word).await?;
        }
        if !self.impebreak || program.len() < self.progbuf_size as usize {
            self.write_progbuf(program.len(), asm::EBREAK).await?;
        }

        self.progbuf_cache[..program.len()].copy_from_slice(program);
        self.progbuf_cache_len = program.len();
        Ok(())
    }

    async fn write_progbuf(&mut self, index: usize, value: u32) -> Result<(), SwdError> {
        match index {
            0 => self.write_dm(Progbuf0(value)).await,
            1 => self.write_dm(Progbuf1(value)).await,
            2 => self.write_dm(Progbuf2(value)).await,
            3 => self.write_dm(Progbuf3(value)).await,
            _ => Err(SwdError::InvalidState),
        }
    }

    // Memory through the hart: lw/sw snippets with s0/s1 as scratch,
    // captured and restored around the access.
    async fn progbuf_read32(&mut self, addr: u32) -> Result<u32, SwdError> {
        let s0 = self.abstract_reg_read(gpr_regno(S0)).await?;

        self.setup_progbuf(&[asm::lw(0, S0, S0)]).await?;

        // Transfer the address into s0, then execute the lw
        self.write_dm(Data0(addr)).await?;
        let mut command = AccessRegisterCommand(0);
        command.set_transfer(true);
        command.set_write(true);
        command.set_aarsize(AccessRegisterCommand::AARSIZE_32);
        command.set_regno(gpr_regno(S0) as u32);
        command.set_postexec(true);
        self.execute_abstract(command).await?;

        let value = self.abstract_reg_read(gpr_regno(S0)).await?;

        self.abstract_reg_write(gpr_regno(S0), s0).await?;
        Ok(value)
    }

    async fn progbuf_write32(&mut self, addr: u32, value: u32) -> Result<(), SwdError> {
        let s0 = self.abstract_reg_read(gpr_regno(S0)).await?;
        let s1 = self.abstract_reg_read(gpr_regno(S1)).await?;

        self.setup_progbuf(&[asm::sw(0, S0, S1)]).await?;

        self.abstract_reg_write(gpr_regno(S0), addr).await?;

        // Transfer the value into s1, then execute the sw
        self.write_dm(Data0(value)).await?;
        let mut command = AccessRegisterCommand(0);
        command.set_transfer(true);
        command.set_write(true);
        command.set_aarsize(AccessRegisterCommand::AARSIZE_32);
        command.set_regno(gpr_regno(S1) as u32);
        command.set_postexec(true);
        self.execute_abstract(command).await?;

        self.abstract_reg_write(gpr_regno(S1), s1).await?;
        self.abstract_reg_write(gpr_regno(S0), s0).await?;
        Ok(())
    }

    // Route resolution.  Returns true for SBA.  Never halts a hart.
    fn route_is_sba(&self, route: MemRoute) -> Result<bool, SwdError> {
        let hart = &self.harts[self.hartsel as usize];
        match route {
            MemRoute::SystemBus => {
                if self.sba_supported {
                    Ok(true)
                } else {
                    Err(SwdError::InvalidState)
                }
            }
            MemRoute::ProgramBuffer => {
                if hart.halt_known && hart.halted {
                    Ok(false)
                } else {
                    Err(SwdError::NotHalted)
                }
            }
            MemRoute::Auto => {
                if self.sba_supported {
                    Ok(true)
                } else if hart.halt_known && hart.halted {
                    Ok(false)
                } else {
                    Err(SwdError::NotHalted)
                }
            }
        }
    }

    async fn sba_wait_idle(&mut self) -> Result<(), SwdError> {
        let deadline = Instant::now() + DM_TIMEOUT;
        loop {
            let sbcs: Sbcs = self.read_dm().await?;
            if !sbcs.sbbusy() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!("Error: SBA stuck busy");
                return Err(SwdError::Timeout);
            }
            Timer::after(DM_POLL).await;
        }
    }

    async fn sba_check_error(&mut self) -> Result<(), SwdError> {
        let sbcs: Sbcs = self.read_dm().await?;
        if sbcs.sberror() != 0 {
            let kind = BusError::parse(sbcs.sberror() as u8);
            self.write_dm(Sbcs::clear_errors()).await?;
            debug!("Error: SBA {kind:?}");
            return Err(SwdError::Bus(kind));
        }
        Ok(())
    }

    async fn sba_read32(&mut self, addr: u32) -> Result<u32, SwdError> {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(Sbcs::SBACCESS_32);
        sbcs.set_sbreadonaddr(true);
        self.write_dm(sbcs).await?;

        // The address write kicks the transfer
        self.write_dm(Sbaddress0(addr)).await?;
        self.sba_wait_idle().await?;

        let data: Sbdata0 = self.read_dm().await?;
        self.sba_check_error().await?;
        Ok(data.0)
    }

    async fn sba_write32(&mut self, addr: u32, value: u32) -> Result<(), SwdError> {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(Sbcs::SBACCESS_32);
        self.write_dm(sbcs).await?;

        self.write_dm(Sbaddress0(addr)).await?;
        // Posted: the data write starts the transfer
        self.write_dm(Sbdata0(value)).await?;

        self.sba_wait_idle().await?;
        self.sba_check_error().await
    }

    async fn sba_read32_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), SwdError> {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(Sbcs::SBACCESS_32);
        sbcs.set_sbreadonaddr(true);
        sbcs.set_sbreadondata(true);
        sbcs.set_sbautoincrement(true);
        self.write_dm(sbcs).await?;

        self.write_dm(Sbaddress0(addr)).await?;
        self.sba_wait_idle().await?;

        let last = buf.len() - 1;
        for slot in buf[..last].iter_mut() {
            let data: Sbdata0 = self.read_dm().await?;
            *slot = data.0;
        }

        // Stop the prefetching before draining the final word
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(Sbcs::SBACCESS_32);
        self.write_dm(sbcs).await?;
        self.sba_wait_idle().await?;

        let data: Sbdata0 = self.read_dm().await?;
        buf[last] = data.0;

        self.sba_check_error().await
    }

    async fn sba_write32_bulk(&mut self, addr: u32, data: &[u32]) -> Result<(), SwdError> {
        let mut sbcs = Sbcs(0);
        sbcs.set_sbaccess(Sbcs::SBACCESS_32);
        sbcs.set_sbautoincrement(true);
        self.write_dm(sbcs).await?;

        self.write_dm(Sbaddress0(addr)).await?;
        for &word in data {
            self.write_dm(Sbdata0(word)).await?;
        }

        self.sba_wait_idle().await?;
        self.sba_check_error().await
    }
}

fn check_alignment(addr: u32) -> Result<(), SwdError> {
    if addr & 0x3 != 0 {
        Err(SwdError::Alignment)
    } else {
        Ok(())
    }
}
