// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! SWD session layer.
//!
//! [`SwdInterface`] owns a line engine and turns it into a connected DAP
//! session: dormant wake and line reset, IDCODE validation, debug power-up,
//! the SELECT cache, posted AP reads (the RDBUFF dance is hidden here), WAIT
//! retry and FAULT recovery.
//!
//! The layers above ([`crate::dmi`], [`crate::debug`]) only ever see typed
//! DP/AP register accesses.

use core::fmt;
use embassy_time::{Duration, Instant, Timer};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use polliwog_core::arm::dp::{Abort, CtrlStat, IdCode, RdBuff, Select};
use polliwog_core::arm::register::{ApRegister, DpRegister};
use polliwog_core::parity;

use crate::SwdError;
use crate::protocol::{
    DORMANT_WAKE_HIGH_CYCLES, DORMANT_WAKE_LOW_CYCLES, LINE_RESET_HIGH_CYCLES,
    LINE_RESET_IDLE_CYCLES, MAX_FREQUENCY_KHZ, MIN_FREQUENCY_KHZ, POST_TRANSACTION_IDLE,
    SELECTION_ALERT_SEQUENCE, SWD_ACTIVATION_CODE, SWD_TO_DORMANT_SEQUENCE, SwdIo,
};

// Default retries after a WAIT ACK
const DEFAULT_WAIT_RETRIES: u32 = 2;

// Debug domain power-up handshake budget
const POWER_UP_TIMEOUT: Duration = Duration::from_millis(100);
const POWER_UP_POLL: Duration = Duration::from_micros(100);

/// SWD session object.
///
/// Generic over the line engine; `polliwog-pio` provides the RP2350 PIO
/// implementation of [`SwdIo`].
///
/// ```ignore
/// let mut swd = SwdInterface::new(io);
/// let idcode = swd.connect().await?;
/// info!("connected: {idcode}");
/// ```
#[derive(Debug)]
pub struct SwdInterface<IO: SwdIo> {
    pub(crate) io: IO,
    idcode: Option<IdCode>,
    powered_up: bool,
    select: Select,
    // The SELECT cache is only authoritative after we have written SELECT
    // at least once since connect/ABORT/line-reset.
    select_known: bool,
    wait_retries: u32,
}

impl<IO: SwdIo> SwdInterface<IO> {
    /// Create a session over the given line engine.  Does not touch the
    /// wire; call [`Self::connect()`].
    pub fn new(io: IO) -> Self {
        Self {
            io,
            idcode: None,
            powered_up: false,
            select: Select::default(),
            select_known: false,
            wait_retries: DEFAULT_WAIT_RETRIES,
        }
    }

    /// Number of automatic retries after a WAIT ACK.
    pub fn set_wait_retries(&mut self, retries: u32) {
        self.wait_retries = retries;
    }

    /// Whether a target answered the last connect.
    pub fn is_connected(&self) -> bool {
        self.idcode.is_some()
    }

    /// IDCODE read at connect, if connected.
    pub fn idcode(&self) -> Option<IdCode> {
        self.idcode
    }

    /// Reprogram the SWCLK frequency.  Permitted while connected.
    pub fn set_frequency(&mut self, khz: u32) -> Result<(), SwdError> {
        self.io.set_frequency(khz)
    }

    /// Current SWCLK frequency in kHz.
    pub fn frequency(&self) -> u32 {
        self.io.frequency()
    }

    /// Advisory clamp of a requested frequency into the device-safe range.
    pub fn clamp_frequency(khz: u32) -> u32 {
        khz.clamp(MIN_FREQUENCY_KHZ, MAX_FREQUENCY_KHZ)
    }

    fn reset_session_state(&mut self) {
        self.idcode = None;
        self.powered_up = false;
        self.select = Select::default();
        self.select_known = false;
    }

    /// Connect to the target: dormant-to-SWD wake, line reset, IDCODE
    /// check, sticky-error clear, debug domain power-up.
    ///
    /// Returns the target's IDCODE on success.  An unreadable or
    /// all-zeros/all-ones IDCODE is a connection failure.
    pub async fn connect(&mut self) -> Result<IdCode, SwdError> {
        trace!("Exec:  Connect");
        self.reset_session_state();

        // Claim the line and start from a known state
        self.io.turnaround_out().await;
        self.io.idle(POST_TRANSACTION_IDLE).await;
        Timer::after(Duration::from_micros(500)).await;

        // Push any previously-active SWD target back into dormant state so
        // the wake below starts from a known place
        self.line_reset_high_only().await;
        self.io
            .write_bits(SWD_TO_DORMANT_SEQUENCE as u32, 16)
            .await;
        Timer::after(Duration::from_micros(100)).await;

        // Dormant-to-SWD wake: high cycles, the 128-bit selection alert,
        // low cycles, then the activation code
        self.line_reset_high_only().await;
        self.io.write_bits(0xFF, DORMANT_WAKE_HIGH_CYCLES).await;
        for &word in SELECTION_ALERT_SEQUENCE.iter() {
            self.io.write_bits(word, 32).await;
        }
        self.io.idle(DORMANT_WAKE_LOW_CYCLES).await;
        self.io.write_bits(SWD_ACTIVATION_CODE as u32, 8).await;

        // Line reset, then the DP must answer
        self.line_reset().await;

        let idcode: IdCode = IdCode::from(self.txn_read(SwdOp::DpRead(IdCode::ADDR)).await?);
        if !idcode.indicates_target() {
            warn!("IDCODE 0x{:08X} does not indicate a target", idcode.raw());
            return Err(SwdError::Protocol);
        }
        debug!("Value: IDCODE {idcode}");

        // Clear any stale sticky errors before powering up
        self.txn_write(SwdOp::DpWrite(Abort::ADDR), Abort::clear_all().into())
            .await?;

        self.power_up_debug_domain().await?;

        self.idcode = Some(idcode);
        trace!("OK:    Connect");
        Ok(idcode)
    }

    /// Drop the power-up requests, line-reset, and leave the pins released.
    /// Always succeeds; wire errors on the way down are logged only.
    pub async fn disconnect(&mut self) {
        trace!("Exec:  Disconnect");
        if self.powered_up {
            let cleared: u32 = CtrlStat::default().into();
            if let Err(e) = self.txn_write(SwdOp::DpWrite(CtrlStat::ADDR), cleared).await {
                warn!("CTRL/STAT clear on disconnect failed: {e}");
            }
        }
        self.line_reset().await;
        self.io.release().await;
        self.reset_session_state();
    }

    /// Force the pins passive without touching the wire.  Synchronous, so
    /// teardown paths that cannot await (drop) can still leave the lines
    /// parked; [`Self::disconnect`] is the orderly version.
    pub fn park(&mut self) {
        self.io.park();
        self.reset_session_state();
    }

    /// Verify the link is still up by re-reading the IDCODE.  Resets
    /// session state on failure so the caller knows to reconnect.
    pub async fn keepalive(&mut self) -> Result<(), SwdError> {
        self.read_idcode()
            .await
            .map(|_| ())
            .inspect_err(|_| self.reset_session_state())
    }

    /// Read the DP IDCODE register.
    pub async fn read_idcode(&mut self) -> Result<IdCode, SwdError> {
        // IDCODE never needs a SELECT update
        let raw = self.read_op(SwdOp::DpRead(IdCode::ADDR)).await?;
        Ok(IdCode::from(raw))
    }

    /// Read a Debug Port register.
    pub async fn dp_read<R: DpRegister>(&mut self) -> Result<R, SwdError> {
        let raw = self.read_op(SwdOp::DpRead(R::ADDR)).await?;
        Ok(R::from(raw))
    }

    /// Write a Debug Port register.
    pub async fn dp_write<R: DpRegister>(&mut self, value: R) -> Result<(), SwdError> {
        self.write_op(SwdOp::DpWrite(R::ADDR), value.into()).await
    }

    /// Read an Access Port register.  Handles SELECT and the posted-read
    /// RDBUFF follow-up; the value returned is the value the AP produced
    /// for *this* access.
    pub async fn ap_read<R: ApRegister>(&mut self, apsel: u8) -> Result<R, SwdError> {
        let raw = self.ap_read_raw(apsel, R::ADDR).await?;
        Ok(R::from(raw))
    }

    /// Write an Access Port register.
    pub async fn ap_write<R: ApRegister>(&mut self, apsel: u8, value: R) -> Result<(), SwdError> {
        self.ap_write_raw(apsel, R::ADDR, value.into()).await
    }

    /// Read an Access Port register by raw address.
    pub async fn ap_read_raw(&mut self, apsel: u8, addr: u8) -> Result<u32, SwdError> {
        if !self.powered_up {
            return Err(SwdError::NotConnected);
        }
        self.ensure_select_ap(apsel, addr).await?;

        // AP reads are posted: this result is stale...
        let _ = self.recovered(SwdOp::ApRead(addr), None).await?;

        // ...the actual value arrives via RDBUFF (never needs SELECT)
        self.read_op(SwdOp::DpRead(RdBuff::ADDR)).await
    }

    /// Write an Access Port register by raw address.
    pub async fn ap_write_raw(&mut self, apsel: u8, addr: u8, value: u32) -> Result<(), SwdError> {
        if !self.powered_up {
            return Err(SwdError::NotConnected);
        }
        self.ensure_select_ap(apsel, addr).await?;
        self.recovered(SwdOp::ApWrite(addr), Some(value))
            .await
            .map(|_| ())
    }
}

// Internal: sequences, SELECT management, recovery
impl<IO: SwdIo> SwdInterface<IO> {
    // 50+ clocks with SWDIO high, no trailing idle.  Used mid-wake.
    async fn line_reset_high_only(&mut self) {
        self.io.write_bits(0xFFFF_FFFF, 32).await;
        self.io
            .write_bits(0x7FFFF, LINE_RESET_HIGH_CYCLES - 32)
            .await;
    }

    async fn line_reset(&mut self) {
        self.line_reset_high_only().await;
        self.io.idle(LINE_RESET_IDLE_CYCLES).await;
        Timer::after(Duration::from_micros(100)).await;
        // The DP forgets SELECT across a line reset
        self.select = Select::default();
        self.select_known = false;
    }

    async fn power_up_debug_domain(&mut self) -> Result<(), SwdError> {
        let mut request = CtrlStat::default();
        request.set_cdbgpwrupreq(true);
        request.set_csyspwrupreq(true);
        self.write_op(SwdOp::DpWrite(CtrlStat::ADDR), request.into())
            .await?;

        let deadline = Instant::now() + POWER_UP_TIMEOUT;
        loop {
            let status = CtrlStat::from(self.read_op(SwdOp::DpRead(CtrlStat::ADDR)).await?);
            if status.powered_up() {
                debug!("OK:    Debug domain powered up");
                self.powered_up = true;
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("Debug domain power-up timed out, CTRL/STAT {status}");
                return Err(SwdError::Timeout);
            }
            Timer::after(POWER_UP_POLL).await;
        }
    }

    async fn ensure_select_ap(&mut self, apsel: u8, addr: u8) -> Result<(), SwdError> {
        let mut needed = self.select;
        needed.set_apsel(apsel);
        needed.set_apbanksel_from_addr(addr);
        if !self.select_known || needed != self.select {
            trace!("Exec:  Update SELECT {needed}");
            self.recovered(SwdOp::DpWrite(Select::ADDR), Some(needed.into()))
                .await?;
            self.select = needed;
            self.select_known = true;
        }
        Ok(())
    }

    async fn read_op(&mut self, op: SwdOp) -> Result<u32, SwdError> {
        self.recovered(op, None).await
    }

    async fn write_op(&mut self, op: SwdOp, value: u32) -> Result<(), SwdError> {
        self.recovered(op, Some(value)).await?;

        if let SwdOp::DpWrite(addr) = op {
            match addr {
                // ABORT invalidates the SELECT cache
                Abort::ADDR => self.select_known = false,
                Select::ADDR => {
                    self.select = Select::from(value);
                    self.select_known = true;
                }
                _ => (),
            }
        }
        Ok(())
    }

    // Run one transaction; on FAULT/parity/protocol outcomes clear the DP
    // sticky flags via ABORT before surfacing the error.  The failed
    // operation is NOT retried here - WAIT is the only retried ACK, and the
    // line engine budget below handles it.
    async fn recovered(&mut self, op: SwdOp, write: Option<u32>) -> Result<u32, SwdError> {
        let result = match write {
            Some(value) => self.txn_write(op, value).await.map(|_| 0),
            None => self.txn_read(op).await,
        };

        match result {
            Err(e) if e.requires_reset() => {
                self.clear_sticky_errors().await;
                Err(e)
            }
            other => other,
        }
    }

    // Classify via CTRL/STAT, then write the matching ABORT clear bits.
    async fn clear_sticky_errors(&mut self) {
        let mut abort = Abort::clear_all();
        match self.txn_read(SwdOp::DpRead(CtrlStat::ADDR)).await {
            Ok(raw) => {
                let status = CtrlStat::from(raw);
                if status.has_errors() {
                    warn!(
                        "DP sticky flags: orun={} cmp={} err={} wdata={}",
                        status.stickyorun(),
                        status.stickycmp(),
                        status.stickyerr(),
                        status.wdataerr()
                    );
                    abort = Abort::default();
                    abort.set_orunerrclr(status.stickyorun());
                    abort.set_stkcmpclr(status.stickycmp());
                    abort.set_stkerrclr(status.stickyerr());
                    abort.set_wderrclr(status.wdataerr());
                }
            }
            Err(e) => warn!("CTRL/STAT read during recovery failed: {e}"),
        }

        if let Err(e) = self.txn_write(SwdOp::DpWrite(Abort::ADDR), abort.into()).await {
            warn!("ABORT during recovery failed: {e}");
        }
        self.select_known = false;
    }

    // Lowest-level read transaction: header, turnaround, ACK, data+parity.
    async fn txn_read(&mut self, op: SwdOp) -> Result<u32, SwdError> {
        debug_assert!(op.is_read());
        let request = op.request_byte();

        let mut attempt = 0;
        loop {
            self.io.write_bits(request as u32, 8).await;
            self.io.turnaround_in().await;
            let ack = self.io.read_bits(3).await as u8;

            match SwdError::from_ack(ack) {
                Ok(()) => {
                    let data = self.io.read_bits(32).await;
                    let parity_bit = self.io.read_bits(1).await & 1 == 1;
                    self.io.turnaround_out().await;
                    self.io.idle(POST_TRANSACTION_IDLE).await;

                    if parity(data) != parity_bit {
                        debug!("Error: {op} parity: data=0x{data:08X} parity={parity_bit}");
                        return Err(SwdError::Parity);
                    }
                    trace!("OK:    {op} 0x{data:08X}");
                    return Ok(data);
                }
                Err(e) => {
                    self.io.turnaround_out().await;
                    self.io.idle(POST_TRANSACTION_IDLE).await;
                    if e != SwdError::Wait {
                        debug!("Error: {op} ACK 0b{ack:03b}");
                        return Err(e);
                    }
                }
            }

            attempt += 1;
            if attempt > self.wait_retries {
                debug!("Error: {op} WAIT retries exhausted");
                return Err(SwdError::Wait);
            }
            trace!("Retry: {op} {attempt}");
        }
    }

    // Lowest-level write transaction: header, turnaround, ACK, data+parity.
    async fn txn_write(&mut self, op: SwdOp, value: u32) -> Result<(), SwdError> {
        debug_assert!(!op.is_read());
        let request = op.request_byte();

        let mut attempt = 0;
        loop {
            self.io.write_bits(request as u32, 8).await;
            self.io.turnaround_in().await;
            let ack = self.io.read_bits(3).await as u8;

            match SwdError::from_ack(ack) {
                Ok(()) => {
                    self.io.turnaround_out().await;
                    self.io.write_bits(value, 32).await;
                    self.io.write_bits(parity(value) as u32, 1).await;
                    self.io.idle(POST_TRANSACTION_IDLE).await;
                    trace!("OK:    {op} 0x{value:08X}");
                    return Ok(());
                }
                Err(e) => {
                    self.io.turnaround_out().await;
                    self.io.idle(POST_TRANSACTION_IDLE).await;
                    if e != SwdError::Wait {
                        debug!("Error: {op} ACK 0b{ack:03b}");
                        return Err(e);
                    }
                }
            }

            attempt += 1;
            if attempt > self.wait_retries {
                debug!("Error: {op} WAIT retries exhausted");
                return Err(SwdError::Wait);
            }
            trace!("Retry: {op} {attempt}");
        }
    }
}

/// A single SWD transaction.
///
/// The request byte layout, transmitted LSB-first:
///
/// | Bit | Field |
/// |-----|------------------------------|
/// | 0   | Start (1)                    |
/// | 1   | APnDP                        |
/// | 2   | RnW                          |
/// | 3   | A2                           |
/// | 4   | A3                           |
/// | 5   | Parity over APnDP/RnW/A2/A3  |
/// | 6   | Stop (0)                     |
/// | 7   | Park (1)                     |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdOp {
    DpRead(u8),
    DpWrite(u8),
    ApRead(u8),
    ApWrite(u8),
}

impl SwdOp {
    pub fn is_read(self) -> bool {
        matches!(self, SwdOp::DpRead(_) | SwdOp::ApRead(_))
    }

    /// Encode the 8-bit request header.
    pub fn request_byte(self) -> u8 {
        let (apndp, rnw, addr) = match self {
            SwdOp::DpRead(a) => (0u8, 1u8, a),
            SwdOp::DpWrite(a) => (0, 0, a),
            SwdOp::ApRead(a) => (1, 1, a),
            SwdOp::ApWrite(a) => (1, 0, a),
        };
        let a = (addr >> 2) & 0b11;
        let parity_bit = (apndp ^ rnw ^ (a & 1) ^ (a >> 1)) & 1;

        0x81 | apndp << 1 | rnw << 2 | a << 3 | parity_bit << 5
    }
}

impl fmt::Display for SwdOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwdOp::DpRead(a) => write!(f, "DP read 0x{a:02X}"),
            SwdOp::DpWrite(a) => write!(f, "DP write 0x{a:02X}"),
            SwdOp::ApRead(a) => write!(f, "AP read 0x{a:02X}"),
            SwdOp::ApWrite(a) => write!(f, "AP write 0x{a:02X}"),
        }
    }
}
