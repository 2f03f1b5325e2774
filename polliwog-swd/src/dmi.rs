// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! DMI transport.
//!
//! Packs Debug Module Interface operations into accesses to the RP2350's
//! RISC-V Access Port (register layout in [`polliwog_core::riscv::dmi`]) and
//! polls each one to completion.  Everything the Debug Module driver does
//! goes through [`DmiTransport::read`] and [`DmiTransport::write`].

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use polliwog_core::arm::register::ApRegister;
use polliwog_core::riscv::dmi::{self, DmiHi, DmiLo, DmiOp, DmiStatus, Dtmcs};
use polliwog_core::rp;

use crate::SwdError;
use crate::interface::SwdInterface;
use crate::protocol::SwdIo;

// The DTM reports the real width in dtmcs.abits; 7 bits until then.
const DEFAULT_ABITS: u8 = 7;

// Poll budget for a single DMI operation
const DEFAULT_BUSY_RETRIES: u32 = 16;

// After this many consecutive busy responses, suggest slowing the wire
const SLOW_CLOCK_HINT_THRESHOLD: u32 = 4;

/// DMI operations over the RISC-V AP.
#[derive(Debug)]
pub struct DmiTransport<IO: SwdIo> {
    swd: SwdInterface<IO>,
    abits: u8,
    busy_retries: u32,
}

impl<IO: SwdIo> DmiTransport<IO> {
    pub fn new(swd: SwdInterface<IO>) -> Self {
        Self {
            swd,
            abits: DEFAULT_ABITS,
            busy_retries: DEFAULT_BUSY_RETRIES,
        }
    }

    /// The SWD session underneath, for connection management.
    pub fn swd(&mut self) -> &mut SwdInterface<IO> {
        &mut self.swd
    }

    /// Poll budget for a single DMI operation.
    pub fn set_busy_retries(&mut self, retries: u32) {
        self.busy_retries = retries;
    }

    /// Discover the DTM: check the DTM version and pick up the DMI address
    /// width.  Called by Debug Module init.
    pub async fn init(&mut self) -> Result<(), SwdError> {
        let dtmcs: Dtmcs = self.swd.ap_read(rp::RISCV_AP).await?;
        trace!("Value: DTMCS {dtmcs:?}");

        if dtmcs.version() != 1 {
            warn!("Unsupported DTM version {}", dtmcs.version());
            return Err(SwdError::Protocol);
        }

        self.abits = if dtmcs.abits() != 0 {
            dtmcs.abits() as u8
        } else {
            warn!("DTM reports zero abits, assuming {DEFAULT_ABITS}");
            DEFAULT_ABITS
        };
        debug!("Value: DMI address width {} bits", self.abits);

        Ok(())
    }

    /// DMI address width discovered at [`Self::init`].
    pub fn abits(&self) -> u8 {
        self.abits
    }

    /// Read a Debug Module register.
    pub async fn read(&mut self, addr: u32) -> Result<u32, SwdError> {
        self.op(addr, 0, DmiOp::Read).await
    }

    /// Write a Debug Module register.
    pub async fn write(&mut self, addr: u32, value: u32) -> Result<(), SwdError> {
        self.op(addr, value, DmiOp::Write).await.map(|_| ())
    }

    // Issue one DMI op and poll it to quiescence.  On timeout the DM is
    // left untouched - busy state stays observable for the next caller.
    async fn op(&mut self, addr: u32, data: u32, op: DmiOp) -> Result<u32, SwdError> {
        trace!("Exec:  DMI {op:?} 0x{addr:02X} 0x{data:08X}");
        let (lo, hi) = dmi::pack_request(addr, data, op, self.abits);

        self.swd.ap_write_raw(rp::RISCV_AP, DmiLo::ADDR, lo).await?;
        self.swd.ap_write_raw(rp::RISCV_AP, DmiHi::ADDR, hi).await?;

        let mut attempt = 0;
        loop {
            let lo = self.swd.ap_read_raw(rp::RISCV_AP, DmiLo::ADDR).await?;
            let hi = self.swd.ap_read_raw(rp::RISCV_AP, DmiHi::ADDR).await?;
            let (status, value) = dmi::unpack_response(lo, hi);

            match status {
                DmiStatus::Ok => {
                    trace!("OK:    DMI {op:?} 0x{addr:02X} -> 0x{value:08X}");
                    return Ok(value);
                }
                DmiStatus::Busy => {
                    attempt += 1;
                    if attempt == SLOW_CLOCK_HINT_THRESHOLD {
                        info!(
                            "DMI busy persists at {} kHz - a lower SWCLK frequency may help",
                            self.swd.frequency()
                        );
                    }
                    if attempt > self.busy_retries {
                        debug!("Error: DMI {op:?} 0x{addr:02X} still busy, abandoning");
                        return Err(SwdError::Timeout);
                    }
                }
                DmiStatus::Failed | DmiStatus::Reserved => {
                    debug!("Error: DMI {op:?} 0x{addr:02X} status {status:?}");
                    self.dmireset().await;
                    return Err(SwdError::Protocol);
                }
            }
        }
    }

    // Strobe dtmcs.dmireset to clear a sticky error.  Best-effort.
    async fn dmireset(&mut self) {
        let mut dtmcs = Dtmcs(0);
        dtmcs.set_dmireset(true);
        if let Err(e) = self.swd.ap_write(rp::RISCV_AP, dtmcs).await {
            warn!("dmireset failed: {e}");
        }
    }
}
