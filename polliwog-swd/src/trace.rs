// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! Instruction tracing.
//!
//! A step-and-observe loop over [`DebugModule`]: read the PC, fetch the
//! instruction word non-intrusively over SBA, optionally snapshot the
//! GPRs, hand the record to a callback, then single-step.  The callback's
//! return value is the only cancellation channel.
//!
//! Each record strictly precedes the step that retires the instruction it
//! describes, so with register capture the callback sees the hart exactly
//! as-of that PC.  Tracing is only well-defined when the target's
//! interrupt sources are quiesced or masked (e.g. `mstatus.MIE` clear) -
//! an interrupt taken mid-trace skews the stream.

#[allow(unused_imports)]
use log::{debug, trace, warn};

use crate::SwdError;
use crate::debug::{DebugModule, MemRoute};
use crate::protocol::SwdIo;

/// One traced instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TraceRecord {
    /// PC of the instruction about to retire.
    pub pc: u32,
    /// The instruction word at that PC.
    pub instruction: u32,
    /// x0..x31 as-of this PC; present only when capture was requested.
    pub regs: Option<[u32; 32]>,
}

impl<IO: SwdIo> DebugModule<IO> {
    /// Trace up to `max_instructions` from the hart's current PC.
    ///
    /// The hart must already be halted.  `callback` receives each record
    /// before the instruction retires and returns `true` to continue;
    /// `false` stops the trace after that record.
    ///
    /// Returns the number of records delivered (<= `max_instructions`).
    /// Any transport error aborts the trace.
    pub async fn trace<F>(
        &mut self,
        hart: u8,
        max_instructions: usize,
        mut callback: F,
        capture_regs: bool,
    ) -> Result<usize, SwdError>
    where
        F: FnMut(&TraceRecord) -> bool,
    {
        self.require_init()?;
        self.require_halted(hart).await?;

        let mut delivered = 0;
        for _ in 0..max_instructions {
            let pc = self.read_pc(hart).await?;
            // SBA keeps the fetch invisible to the hart's execution state
            let instruction = self.read_mem32_via(pc, MemRoute::SystemBus).await?;

            let regs = if capture_regs {
                let mut gprs = [0u32; 32];
                self.read_all_gprs(hart, &mut gprs).await?;
                Some(gprs)
            } else {
                None
            };

            let record = TraceRecord {
                pc,
                instruction,
                regs,
            };
            delivered += 1;

            if !callback(&record) {
                trace!("Trace stopped by callback after {delivered} records");
                break;
            }

            self.step(hart).await?;
        }

        debug!("OK:    Traced {delivered} instructions on hart {hart}");
        Ok(delivered)
    }
}
