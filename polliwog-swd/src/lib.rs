// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! polliwog-swd library
//!
//! In-circuit debugger stack for the RP2350's two RISC-V (Hazard3) harts,
//! driven over ARM Serial Wire Debug from a host RP2350.
//!
//! The stack is layered; each layer adds retry and recovery policy over the
//! one below:
//!
//! ```text
//!        Application / firmware shell
//! ------------------------------------
//!        target::Target                 session, slots, error context
//! ------------------------------------
//!        debug::DebugModule             halt/resume/step/reset, registers,
//!          + trace                      program buffer, SBA, tracing
//! ------------------------------------
//!        dmi::DmiTransport              DMI ops over the RISC-V AP
//! ------------------------------------
//!        interface::SwdInterface        wake, SELECT cache, posted reads,
//!                                       WAIT retry, FAULT recovery
//! ------------------------------------
//!        protocol::SwdIo                bit-level contract, implemented by
//!                                       the PIO engine in polliwog-pio
//! ------------------------------------   SWCLK/SWDIO/GND
//!        RP2350 target (RISC-V cores)
//! ```
//!
//! The whole stack is generic over [`protocol::SwdIo`], so everything above
//! the line engine runs (and is tested) on the host against a scripted
//! target.

#![no_std]
#![allow(async_fn_in_trait)]
// See SwdIo: the trait is consumed generically, never as a trait object.

#[cfg(test)]
extern crate std;

pub mod debug;
pub mod dmi;
pub mod interface;
pub mod protocol;
pub mod target;
pub mod trace;

#[cfg(test)]
pub(crate) mod testutil;

#[doc(inline)]
pub use crate::debug::DebugModule;
#[doc(inline)]
pub use crate::interface::SwdInterface;
#[doc(inline)]
pub use crate::protocol::SwdIo;
#[doc(inline)]
pub use crate::target::Target;
#[doc(inline)]
pub use crate::trace::TraceRecord;

use core::fmt;

/// Core error type used across the polliwog debug stack.
///
/// Variants carry a stable numeric code (see [`SwdError::code`]) so a
/// firmware shell can forward them over a wire protocol; 0 is reserved for
/// success and never appears here.
///
/// Helper predicates classify recovery:
///
/// - [`SwdError::is_benign()`] - informational results callers may treat as
///   success.
/// - [`SwdError::requires_retry()`] - transient, worth retrying.
/// - [`SwdError::requires_reset()`] - the link needs a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdError {
    /// WAIT ACKs exhausted the retry budget.
    Wait,

    /// FAULT ACK.  The DP sticky flags have already been cleared via ABORT
    /// by the time this surfaces; the operation itself was not retried.
    Fault,

    /// Line-level protocol violation: an ACK pattern that is none of
    /// OK/WAIT/FAULT, a DMI status that should not occur, or a malformed
    /// connection response.
    Protocol,

    /// Read data failed its parity check - the value cannot be trusted.
    Parity,

    /// A bounded poll (power-up, DMI busy, abstract command, SBA, hart
    /// state) ran out of time.  The operation was abandoned with no partial
    /// state left behind.
    Timeout,

    /// Operation needs a connected target.
    NotConnected,

    /// Operation needs the hart halted.
    NotHalted,

    /// `halt()` on a hart that was already halted.  Informational.
    AlreadyHalted,

    /// The stack was asked to do something its current state forbids, e.g.
    /// a program-buffer snippet larger than the buffer.
    InvalidState,

    /// Session storage could not be allocated.  Unused with statically
    /// allocated sessions; kept for the stable numbering.
    NoMemory,

    /// Rejected at session creation: configuration outside device limits.
    InvalidConfig,

    /// The requested PIO slot is owned by another session.
    ResourceBusy,

    /// A parameter is out of range (hart index, register number, ...).
    InvalidParam,

    /// Operation needs `dm_init()` first.
    NotInitialized,

    /// The Debug Module reported a `cmderr` for an abstract command.
    AbstractCmd(AbstractCmdError),

    /// The System Bus Access engine reported `sberror`.
    Bus(BusError),

    /// Misaligned address rejected before any transfer began.
    Alignment,

    /// A verifying read-back (e.g. after `write_pc`) disagreed with the
    /// value written.
    Verify,
}

impl SwdError {
    /// Decode a 3-bit SWD ACK field (LSB-first off the wire).
    pub fn from_ack(ack: u8) -> Result<(), SwdError> {
        match ack {
            0b001 => Ok(()),
            0b010 => Err(SwdError::Wait),
            0b100 => Err(SwdError::Fault),
            _ => Err(SwdError::Protocol),
        }
    }

    /// Stable numeric code for this error.  0 is success.
    pub fn code(&self) -> u8 {
        match self {
            SwdError::Timeout => 1,
            SwdError::Fault => 2,
            SwdError::Protocol => 3,
            SwdError::Parity => 4,
            SwdError::Wait => 5,
            SwdError::NotConnected => 6,
            SwdError::NotHalted => 7,
            SwdError::AlreadyHalted => 8,
            SwdError::InvalidState => 9,
            SwdError::NoMemory => 10,
            SwdError::InvalidConfig => 11,
            SwdError::ResourceBusy => 12,
            SwdError::InvalidParam => 13,
            SwdError::NotInitialized => 14,
            SwdError::AbstractCmd(_) => 15,
            SwdError::Bus(_) => 16,
            SwdError::Alignment => 17,
            SwdError::Verify => 18,
        }
    }

    /// True for informational results callers may treat as success.
    pub fn is_benign(&self) -> bool {
        matches!(self, SwdError::AlreadyHalted)
    }

    /// True if the error is transient and the operation can be retried.
    pub fn requires_retry(&self) -> bool {
        matches!(self, SwdError::Wait)
    }

    /// True if the link is suspect and a reconnect is the way out.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            SwdError::Fault | SwdError::Parity | SwdError::Protocol
        )
    }

    /// Short human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SwdError::Timeout => "timeout",
            SwdError::Fault => "fault ack",
            SwdError::Protocol => "protocol error",
            SwdError::Parity => "read parity error",
            SwdError::Wait => "wait retries exhausted",
            SwdError::NotConnected => "not connected",
            SwdError::NotHalted => "hart not halted",
            SwdError::AlreadyHalted => "already halted",
            SwdError::InvalidState => "invalid state",
            SwdError::NoMemory => "no memory",
            SwdError::InvalidConfig => "invalid config",
            SwdError::ResourceBusy => "resource busy",
            SwdError::InvalidParam => "invalid parameter",
            SwdError::NotInitialized => "debug module not initialized",
            SwdError::AbstractCmd(_) => "abstract command error",
            SwdError::Bus(_) => "system bus error",
            SwdError::Alignment => "alignment error",
            SwdError::Verify => "verify mismatch",
        }
    }
}

impl fmt::Display for SwdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwdError::AbstractCmd(kind) => write!(f, "{}: {kind:?}", self.as_str()),
            SwdError::Bus(kind) => write!(f, "{}: {kind:?}", self.as_str()),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

impl serde::Serialize for SwdError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("SwdError", 2)?;
        state.serialize_field("kind", self.as_str())?;
        state.serialize_field("code", &self.code())?;
        state.end()
    }
}

/// `abstractcs.cmderr` values, per Debug spec 3.12.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractCmdError {
    /// Command issued while one was executing.
    Busy,
    /// Command type or register not supported.
    NotSupported,
    /// The command raised an exception on the hart.
    Exception,
    /// Hart was not in the state the command needs (e.g. running).
    HaltResume,
    /// The command's bus access failed.
    Bus,
    /// Anything else.
    Other,
}

impl AbstractCmdError {
    /// Decode a non-zero `cmderr` field.
    pub fn parse(cmderr: u8) -> Self {
        match cmderr {
            1 => AbstractCmdError::Busy,
            2 => AbstractCmdError::NotSupported,
            3 => AbstractCmdError::Exception,
            4 => AbstractCmdError::HaltResume,
            5 => AbstractCmdError::Bus,
            _ => AbstractCmdError::Other,
        }
    }
}

/// `sbcs.sberror` values, per Debug spec 3.12.18.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    Timeout,
    BadAddress,
    Alignment,
    BadSize,
    Other,
}

impl BusError {
    /// Decode a non-zero `sberror` field.
    pub fn parse(sberror: u8) -> Self {
        match sberror {
            1 => BusError::Timeout,
            2 => BusError::BadAddress,
            3 => BusError::Alignment,
            4 => BusError::BadSize,
            _ => BusError::Other,
        }
    }
}
