// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Target session object and the process-wide PIO slot registry.
//!
//! A [`Target`] is one debug session: it owns exactly one PIO slot (claimed
//! at creation, released on drop), the whole protocol stack, and a small
//! textual error-context buffer for human diagnostics.  Machine logic keys
//! only on the [`SwdError`] values; the detail buffer is advisory.

use core::cell::Cell;
use core::fmt;
use core::fmt::Write as _;
use critical_section::Mutex;
#[allow(unused_imports)]
use log::{debug, trace, warn};

use crate::SwdError;
use crate::debug::{DebugModule, HaltReason, MemRoute};
use crate::dmi::DmiTransport;
use crate::interface::SwdInterface;
use crate::protocol::{MAX_FREQUENCY_KHZ, MIN_FREQUENCY_KHZ, SwdIo};
use crate::trace::TraceRecord;

/// PIO blocks on the host device.
pub const PIO_BLOCKS: u8 = 2;
/// State machines per PIO block.
pub const STATE_MACHINES_PER_BLOCK: u8 = 4;

/// Size of the per-session error detail buffer.
pub const ERROR_DETAIL_LEN: usize = 128;

/// A `(pio_block, state_machine)` pair - the hardware resource a session
/// owns exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Slot {
    block: u8,
    sm: u8,
}

impl Slot {
    /// A slot within the fixed 2x4 set, or `None` out of range.
    pub const fn new(block: u8, sm: u8) -> Option<Slot> {
        if block < PIO_BLOCKS && sm < STATE_MACHINES_PER_BLOCK {
            Some(Slot { block, sm })
        } else {
            None
        }
    }

    pub const fn block(&self) -> u8 {
        self.block
    }

    pub const fn state_machine(&self) -> u8 {
        self.sm
    }

    const fn index(&self) -> u8 {
        self.block * STATE_MACHINES_PER_BLOCK + self.sm
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PIO{} SM{}", self.block, self.sm)
    }
}

/// Process-wide slot ownership.  One bit per slot; sessions claim at
/// creation and release on drop, so a slot maps to at most one live
/// session.
pub mod registry {
    use super::*;

    static CLAIMED: Mutex<Cell<u8>> = Mutex::new(Cell::new(0));

    /// Claim `slot` for a new session.
    pub(crate) fn claim(slot: Slot) -> Result<(), SwdError> {
        critical_section::with(|cs| {
            let claimed = CLAIMED.borrow(cs);
            let mask = 1u8 << slot.index();
            if claimed.get() & mask != 0 {
                Err(SwdError::ResourceBusy)
            } else {
                claimed.set(claimed.get() | mask);
                Ok(())
            }
        })
    }

    /// Release `slot`.  Idempotent.
    pub(crate) fn release(slot: Slot) {
        critical_section::with(|cs| {
            let claimed = CLAIMED.borrow(cs);
            claimed.set(claimed.get() & !(1u8 << slot.index()));
        })
    }

    /// Whether `slot` is owned by a session.
    pub fn is_claimed(slot: Slot) -> bool {
        critical_section::with(|cs| CLAIMED.borrow(cs).get() & (1u8 << slot.index()) != 0)
    }

    /// Number of owned slots.
    pub fn active_count() -> usize {
        critical_section::with(|cs| CLAIMED.borrow(cs).get().count_ones() as usize)
    }
}

/// Session configuration.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct TargetConfig {
    /// The PIO slot this session owns.
    pub slot: Slot,
    /// SWCLK frequency in kHz, 100..=2000.
    pub frequency_khz: u32,
    /// Retries after a WAIT ACK.
    pub wait_retries: u32,
    /// Poll budget for a DMI operation.
    pub dmi_busy_retries: u32,
    /// Per-hart GPR snapshot caching.
    pub gpr_cache: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            slot: Slot { block: 0, sm: 0 },
            frequency_khz: 1000,
            wait_retries: 2,
            dmi_busy_retries: 16,
            gpr_cache: true,
        }
    }
}

impl TargetConfig {
    fn validate(&self) -> Result<(), SwdError> {
        if !(MIN_FREQUENCY_KHZ..=MAX_FREQUENCY_KHZ).contains(&self.frequency_khz) {
            return Err(SwdError::InvalidConfig);
        }
        Ok(())
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Disconnected,
    /// Connected; carries the IDCODE read at connect.
    Connected(u32),
}

/// One debug session against one RP2350 target.
///
/// ```ignore
/// let config = TargetConfig::default();
/// let mut target = Target::new(io, &config)?;
/// target.connect().await?;
/// target.dm_init().await?;
/// target.halt(0).await?;
/// let pc = target.read_csr(0, 0x7B1).await?;
/// ```
#[derive(Debug)]
pub struct Target<IO: SwdIo> {
    dm: DebugModule<IO>,
    slot: Slot,
    state: TargetState,
    detail: heapless::String<ERROR_DETAIL_LEN>,
}

impl<IO: SwdIo> Target<IO> {
    /// Create a session: validate the configuration, claim the slot, build
    /// the stack.  Does NOT touch the wire - call [`Self::connect`].
    pub fn new(io: IO, config: &TargetConfig) -> Result<Self, SwdError> {
        config.validate()?;
        registry::claim(config.slot)?;

        let mut swd = SwdInterface::new(io);
        swd.set_wait_retries(config.wait_retries);
        if let Err(e) = swd.set_frequency(config.frequency_khz) {
            registry::release(config.slot);
            warn!("Rejected frequency {} kHz: {e}", config.frequency_khz);
            return Err(SwdError::InvalidConfig);
        }

        let mut dmi = DmiTransport::new(swd);
        dmi.set_busy_retries(config.dmi_busy_retries);

        let mut dm = DebugModule::new(dmi);
        dm.set_gpr_cache_enabled(config.gpr_cache);

        debug!("Session created on {}", config.slot);
        Ok(Self {
            dm,
            slot: config.slot,
            state: TargetState::Disconnected,
            detail: heapless::String::new(),
        })
    }

    /// The slot this session owns.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Connection state.
    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, TargetState::Connected(_))
    }

    /// Human-readable context for the most recent non-OK result.
    pub fn last_error_detail(&self) -> &str {
        &self.detail
    }

    /// Connect to the target and power up its debug domain.
    pub async fn connect(&mut self) -> Result<u32, SwdError> {
        let result = self.dm.dmi().swd().connect().await.map(|id| id.raw());
        if let Ok(idcode) = result {
            self.state = TargetState::Connected(idcode);
        }
        self.note("connect", result)
    }

    /// Tear the session down to `Disconnected`.  Wire errors on the way
    /// out are logged, not returned.
    pub async fn disconnect(&mut self) {
        self.dm.dmi().swd().disconnect().await;
        self.dm.mark_uninitialized();
        self.state = TargetState::Disconnected;
    }

    /// Disconnect and consume the session.  The slot is released when the
    /// session drops.
    pub async fn shutdown(mut self) {
        self.disconnect().await;
    }

    /// Re-read the IDCODE to confirm the link is alive.
    pub async fn keepalive(&mut self) -> Result<(), SwdError> {
        if let Err(e) = self.require_connected() {
            return self.note("keepalive", Err(e));
        }
        let result = self.dm.dmi().swd().keepalive().await;
        if result.is_err() {
            self.state = TargetState::Disconnected;
            self.dm.mark_uninitialized();
        }
        self.note("keepalive", result)
    }

    /// IDCODE of the connected target.
    pub fn read_idcode(&self) -> Result<u32, SwdError> {
        match self.state {
            TargetState::Connected(idcode) => Ok(idcode),
            TargetState::Disconnected => Err(SwdError::NotConnected),
        }
    }

    /// Reprogram the SWCLK frequency, clamped to the device-safe range.
    /// Permitted while connected.
    pub fn set_frequency(&mut self, khz: u32) -> Result<(), SwdError> {
        let clamped = SwdInterface::<IO>::clamp_frequency(khz);
        if clamped != khz {
            warn!("Clamping requested frequency {khz} kHz to {clamped} kHz");
        }
        let result = self.dm.dmi().swd().set_frequency(clamped);
        self.note("set_frequency", result)
    }

    /// Current SWCLK frequency in kHz.
    pub fn frequency(&mut self) -> u32 {
        self.dm.dmi().swd().frequency()
    }

    /// Initialise the Debug Module (requires a connection).
    pub async fn dm_init(&mut self) -> Result<(), SwdError> {
        if let Err(e) = self.require_connected() {
            return self.note("dm_init", Err(e));
        }
        let result = self.dm.init().await;
        self.note("dm_init", result)
    }

    pub async fn halt(&mut self, hart: u8) -> Result<(), SwdError> {
        let result = self.dm.halt(hart).await;
        self.note("halt", result)
    }

    pub async fn resume(&mut self, hart: u8) -> Result<(), SwdError> {
        let result = self.dm.resume(hart).await;
        self.note("resume", result)
    }

    pub async fn step(&mut self, hart: u8) -> Result<(), SwdError> {
        let result = self.dm.step(hart).await;
        self.note("step", result)
    }

    pub async fn reset(&mut self, hart: u8, halt_after: bool) -> Result<(), SwdError> {
        let result = self.dm.reset(hart, halt_after).await;
        self.note("reset", result)
    }

    pub async fn is_halted(&mut self, hart: u8) -> Result<bool, SwdError> {
        let result = self.dm.is_halted(hart).await;
        self.note("is_halted", result)
    }

    pub async fn halt_reason(&mut self, hart: u8) -> Result<HaltReason, SwdError> {
        let result = self.dm.halt_reason(hart).await;
        self.note("halt_reason", result)
    }

    pub async fn read_reg(&mut self, hart: u8, regno: u8) -> Result<u32, SwdError> {
        let result = self.dm.read_reg(hart, regno).await;
        self.note("read_reg", result)
    }

    pub async fn write_reg(&mut self, hart: u8, regno: u8, value: u32) -> Result<(), SwdError> {
        let result = self.dm.write_reg(hart, regno, value).await;
        self.note("write_reg", result)
    }

    pub async fn read_all_gprs(&mut self, hart: u8, buf: &mut [u32; 32]) -> Result<(), SwdError> {
        let result = self.dm.read_all_gprs(hart, buf).await;
        self.note("read_all_gprs", result)
    }

    pub async fn read_csr(&mut self, hart: u8, address: u16) -> Result<u32, SwdError> {
        let result = self.dm.read_csr(hart, address).await;
        self.note("read_csr", result)
    }

    pub async fn write_csr(&mut self, hart: u8, address: u16, value: u32) -> Result<(), SwdError> {
        let result = self.dm.write_csr(hart, address, value).await;
        self.note("write_csr", result)
    }

    pub async fn read_pc(&mut self, hart: u8) -> Result<u32, SwdError> {
        let result = self.dm.read_pc(hart).await;
        self.note("read_pc", result)
    }

    pub async fn write_pc(&mut self, hart: u8, pc: u32) -> Result<(), SwdError> {
        let result = self.dm.write_pc(hart, pc).await;
        self.note("write_pc", result)
    }

    pub async fn read_mem32(&mut self, addr: u32) -> Result<u32, SwdError> {
        let result = self.dm.read_mem32(addr).await;
        self.note("read_mem32", result)
    }

    pub async fn write_mem32(&mut self, addr: u32, value: u32) -> Result<(), SwdError> {
        let result = self.dm.write_mem32(addr, value).await;
        self.note("write_mem32", result)
    }

    pub async fn read_mem32_via(&mut self, addr: u32, route: MemRoute) -> Result<u32, SwdError> {
        let result = self.dm.read_mem32_via(addr, route).await;
        self.note("read_mem32", result)
    }

    pub async fn write_mem32_via(
        &mut self,
        addr: u32,
        value: u32,
        route: MemRoute,
    ) -> Result<(), SwdError> {
        let result = self.dm.write_mem32_via(addr, value, route).await;
        self.note("write_mem32", result)
    }

    pub async fn read_mem32_bulk(&mut self, addr: u32, buf: &mut [u32]) -> Result<(), SwdError> {
        let result = self.dm.read_mem32_bulk(addr, buf).await;
        self.note("read_mem32_bulk", result)
    }

    pub async fn write_mem32_bulk(&mut self, addr: u32, data: &[u32]) -> Result<(), SwdError> {
        let result = self.dm.write_mem32_bulk(addr, data).await;
        self.note("write_mem32_bulk", result)
    }

    /// Trace up to `max_instructions` from the hart's current PC; see
    /// [`DebugModule::trace`].
    pub async fn trace<F>(
        &mut self,
        hart: u8,
        max_instructions: usize,
        callback: F,
        capture_regs: bool,
    ) -> Result<usize, SwdError>
    where
        F: FnMut(&TraceRecord) -> bool,
    {
        let result = self
            .dm
            .trace(hart, max_instructions, callback, capture_regs)
            .await;
        self.note("trace", result)
    }

    fn require_connected(&self) -> Result<(), SwdError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SwdError::NotConnected)
        }
    }

    // Record context for any non-OK result; overwritten every time.
    fn note<T>(&mut self, op: &str, result: Result<T, SwdError>) -> Result<T, SwdError> {
        if let Err(e) = &result {
            self.detail.clear();
            let _ = write!(self.detail, "{op}: {e}");
        }
        result
    }
}

impl<IO: SwdIo> Drop for Target<IO> {
    fn drop(&mut self) {
        // Nothing can await here, so the wire-level power-down is
        // shutdown()'s job - but the pins are still force-parked and the
        // slot always comes back.
        self.dm.dmi().swd().park();
        registry::release(self.slot);
        trace!("Session on {} destroyed", self.slot);
    }
}
