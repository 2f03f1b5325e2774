// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! polliwog-pio library
//!
//! The SWD line engine, offloaded to an RP2350 PIO state machine.
//! [`PioSwd`] implements [`polliwog_swd::protocol::SwdIo`]: the host fills
//! and drains the state machine's FIFO and never paces individual bits.
//!
//! The PIO program is a small command dispatcher.  Each burst starts with
//! one FIFO word:
//!
//! ```text
//!   bits  7:0   routine address (shift-out, shift-in, turnaround, park)
//!   bits 15:8   bit count - 1
//! ```
//!
//! followed by a data word for shift-out bursts.  Shift-in bursts push
//! their residue, right-aligned by the host.  SWCLK rides the side-set;
//! SWDIO is sampled while SWCLK is low, just before the rising edge, and
//! driven on the falling edge.  Each bit takes four state-machine cycles,
//! so the clock divider maps `clk_sys` to the 100-2000 kHz SWCLK range.
//!
//! ```ignore
//! let p = embassy_rp::init(Default::default());
//! let Pio { mut common, sm0, .. } = Pio::new(p.PIO0, Irqs);
//!
//! let io = PioSwd::new(&mut common, sm0, p.PIN_2, p.PIN_3, 1000)?;
//! let mut target = Target::new(io, &TargetConfig::default())?;
//! ```

#![no_std]

use embassy_rp::gpio::{Level, Pull};
use embassy_rp::pio::{
    Common, Config, Direction, Instance, Pin, PioPin, ShiftConfig, ShiftDirection, StateMachine,
};
use fixed::FixedU32;
use fixed::types::extra::U8;
#[allow(unused_imports)]
use log::{debug, trace, warn};

use polliwog_swd::SwdError;
use polliwog_swd::protocol::{MAX_FREQUENCY_KHZ, MIN_FREQUENCY_KHZ, SwdIo};

// State-machine cycles per SWCLK period (2 instructions, 1 delay each).
const CYCLES_PER_BIT: u32 = 4;

// PIO addresses of the dispatcher's routines, filled in at load time.
#[derive(Debug, Clone, Copy)]
struct Entries {
    dispatch: u8,
    tx: u8,
    rx: u8,
    turn_in: u8,
    turn_out: u8,
    park: u8,
}

/// SWD line engine on one PIO state machine.
///
/// Owns the state machine and both pins for the lifetime of the session.
/// One `PioSwd` per [`polliwog_swd::target::Slot`].
pub struct PioSwd<'d, PIO: Instance, const SM: usize> {
    sm: StateMachine<'d, PIO, SM>,
    cfg: Config<'d, PIO>,
    // Kept so the drop path can force pin state without the FIFO
    swclk: Pin<'d, PIO>,
    swdio: Pin<'d, PIO>,
    entries: Entries,
    freq_khz: u32,
}

impl<'d, PIO: Instance, const SM: usize> PioSwd<'d, PIO, SM> {
    /// Load the SWD program and configure the state machine.  SWCLK is
    /// driven low, SWDIO released with a pull-up until the session claims
    /// the line.
    pub fn new(
        common: &mut Common<'d, PIO>,
        mut sm: StateMachine<'d, PIO, SM>,
        swclk: impl PioPin,
        swdio: impl PioPin,
        frequency_khz: u32,
    ) -> Result<Self, SwdError> {
        let prg = pio_proc::pio_asm!(
            ".side_set 1 opt",
            // Command dispatcher: low byte of each command word is a
            // routine address, next byte is the bit count - 1.
            "next_cmd:",
            "    pull                side 0",
            "    out pc, 8",
            // Shift out: data word follows the command word.  Data changes
            // while SWCLK is low, the target samples the rising edge.
            "public tx_bits:",
            "    out x, 8",
            "    pull",
            "tx_loop:",
            "    out pins, 1         side 0 [1]",
            "    jmp x-- tx_loop     side 1 [1]",
            "    jmp next_cmd        side 0",
            // Shift in: sample while SWCLK is low, then clock.  The
            // residue is pushed for the host to right-align.
            "public rx_bits:",
            "    out x, 8",
            "rx_loop:",
            "    in pins, 1          side 0 [1]",
            "    jmp x-- rx_loop     side 1 [1]",
            "    push                side 0",
            "    jmp next_cmd",
            // One turnaround cycle, releasing SWDIO to the target.
            "public turn_in:",
            "    set pindirs, 0      side 0 [1]",
            "    jmp next_cmd        side 1 [1]",
            // One turnaround cycle, reclaiming SWDIO from the target.
            "public turn_out:",
            "    nop                 side 0 [1]",
            "    set pindirs, 1      side 1 [1]",
            "    jmp next_cmd        side 0",
            // Park: both lines passive.
            "public park:",
            "    set pindirs, 0      side 0",
            "    jmp next_cmd",
        );
        let loaded = common.load_program(&prg.program);

        let entries = Entries {
            dispatch: loaded.origin,
            tx: loaded.origin + prg.public_defines.tx_bits as u8,
            rx: loaded.origin + prg.public_defines.rx_bits as u8,
            turn_in: loaded.origin + prg.public_defines.turn_in as u8,
            turn_out: loaded.origin + prg.public_defines.turn_out as u8,
            park: loaded.origin + prg.public_defines.park as u8,
        };

        let swclk = common.make_pio_pin(swclk);
        let mut swdio = common.make_pio_pin(swdio);
        // The target may not drive SWDIO until woken; idle it high
        swdio.set_pull(Pull::Up);

        let mut cfg = Config::default();
        cfg.use_program(&loaded, &[&swclk]);
        cfg.set_out_pins(&[&swdio]);
        cfg.set_in_pins(&[&swdio]);
        cfg.set_set_pins(&[&swdio]);
        cfg.shift_out = ShiftConfig {
            auto_fill: false,
            threshold: 32,
            direction: ShiftDirection::Right,
        };
        cfg.shift_in = ShiftConfig {
            auto_fill: false,
            threshold: 32,
            direction: ShiftDirection::Right,
        };
        cfg.clock_divider = divider_for(clk_sys_hz(), frequency_khz)?;

        sm.set_config(&cfg);

        // SWCLK low output, SWDIO released until the wire is claimed
        sm.set_pins(Level::Low, &[&swclk, &swdio]);
        sm.set_pin_dirs(Direction::Out, &[&swclk]);
        sm.set_pin_dirs(Direction::In, &[&swdio]);
        sm.set_enable(true);

        let mut engine = Self {
            sm,
            cfg,
            swclk,
            swdio,
            entries,
            freq_khz: frequency_khz,
        };
        engine.jump_to_dispatcher();

        debug!(
            "PIO SWD engine up at {} kHz (program at 0x{:02X})",
            frequency_khz, entries.dispatch
        );
        Ok(engine)
    }

    fn jump_to_dispatcher(&mut self) {
        let instruction = pio::Instruction {
            operands: pio::InstructionOperands::JMP {
                condition: pio::JmpCondition::Always,
                address: self.entries.dispatch,
            },
            delay: 0,
            side_set: None,
        }
        .encode(pio::SideSet::new(true, 1, false));
        unsafe {
            self.sm.exec_instr(instruction);
        }
    }

    fn command(entry: u8, count: u8) -> u32 {
        debug_assert!((1..=32).contains(&count));
        entry as u32 | ((count as u32 - 1) << 8)
    }
}

impl<'d, PIO: Instance, const SM: usize> SwdIo for PioSwd<'d, PIO, SM> {
    async fn write_bits(&mut self, bits: u32, count: u8) {
        let command = Self::command(self.entries.tx, count);
        self.sm.tx().wait_push(command).await;
        self.sm.tx().wait_push(bits).await;
    }

    async fn read_bits(&mut self, count: u8) -> u32 {
        let command = Self::command(self.entries.rx, count);
        self.sm.tx().wait_push(command).await;
        let raw = self.sm.rx().wait_pull().await;
        // The shift register fills from the top; right-align
        raw >> (32 - count as u32)
    }

    async fn turnaround_in(&mut self) {
        let command = self.entries.turn_in as u32;
        self.sm.tx().wait_push(command).await;
    }

    async fn turnaround_out(&mut self) {
        let command = self.entries.turn_out as u32;
        self.sm.tx().wait_push(command).await;
    }

    async fn release(&mut self) {
        let command = self.entries.park as u32;
        self.sm.tx().wait_push(command).await;
    }

    /// Force both lines passive right now: SWDIO input, SWCLK driven low.
    /// Plain pin writes, no FIFO - callable from a destructor.  The state
    /// machine is left disabled; a new session rebuilds the engine.
    fn park(&mut self) {
        self.sm.set_enable(false);
        self.sm.set_pin_dirs(Direction::In, &[&self.swdio]);
        self.sm.set_pins(Level::Low, &[&self.swclk]);
        self.sm.set_pin_dirs(Direction::Out, &[&self.swclk]);
    }

    /// Reprogram the divider.  Must not be called mid-transaction; the
    /// session layer only changes frequency between operations.
    fn set_frequency(&mut self, khz: u32) -> Result<(), SwdError> {
        let divider = divider_for(clk_sys_hz(), khz)?;
        self.cfg.clock_divider = divider;

        self.sm.set_enable(false);
        self.sm.set_config(&self.cfg);
        self.sm.set_enable(true);
        self.jump_to_dispatcher();

        self.freq_khz = khz;
        trace!("SWCLK now {khz} kHz");
        Ok(())
    }

    fn frequency(&self) -> u32 {
        self.freq_khz
    }
}

fn clk_sys_hz() -> u32 {
    embassy_rp::clocks::clk_sys_freq()
}

// Divider mapping clk_sys to the requested SWCLK, at CYCLES_PER_BIT state
// machine cycles per bit.
fn divider_for(clk_sys_hz: u32, khz: u32) -> Result<FixedU32<U8>, SwdError> {
    if !(MIN_FREQUENCY_KHZ..=MAX_FREQUENCY_KHZ).contains(&khz) {
        warn!("SWCLK {khz} kHz outside supported range");
        return Err(SwdError::InvalidParam);
    }
    let divider = clk_sys_hz as f32 / (khz as f32 * 1000.0 * CYCLES_PER_BIT as f32);
    Ok(fixed::traits::ToFixed::to_fixed(divider))
}
