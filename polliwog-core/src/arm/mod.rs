// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! ARM ADIv5 Debug Access Port concepts.
//!
//! Only the Debug Port side is modelled - the single Access Port polliwog
//! talks to is the RP2350's RISC-V DMI port, whose registers are defined in
//! [`crate::riscv::dmi`].

pub mod dp;
pub mod register;
