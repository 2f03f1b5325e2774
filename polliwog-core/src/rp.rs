// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! RP2350 target constants.

use static_assertions::const_assert;

/// DPIDR the RP2350's SW-DP reports after a dormant-to-SWD wake.
pub const RP2350_DPIDR: u32 = 0x4C01_3477;

/// APSEL of the Access Port fronting the RISC-V (Hazard3) Debug Transport
/// Module.  Fixed by the silicon; see [`crate::riscv::dmi`] for the
/// register layout behind it.
pub const RISCV_AP: u8 = 2;

/// Number of RISC-V harts.
pub const NUM_HARTS: u8 = 2;

/// Main SRAM window - the usual home for debugger-staged code and data.
pub const SRAM_BASE: u32 = 0x2000_0000;
pub const SRAM_END: u32 = 0x2008_2000;

/// Boot ROM base, where the harts land after `ndmreset`.
pub const ROM_BASE: u32 = 0x0000_0000;

const_assert!(SRAM_BASE < SRAM_END);
const_assert!((SRAM_END - SRAM_BASE) % 4 == 0);

#[cfg(test)]
mod test {
    use super::*;
    use crate::arm::dp::IdCode;

    #[test]
    fn dpidr_is_a_valid_idcode() {
        let idcode = IdCode::new(RP2350_DPIDR);
        assert!(idcode.indicates_target());
        assert_eq!(idcode.designer_id(), 0x23B);
    }

    #[test]
    fn sram_window_is_word_aligned() {
        assert_eq!(SRAM_BASE % 4, 0);
        assert_eq!(SRAM_END % 4, 0);
        assert!(SRAM_BASE < SRAM_END);
    }
}
