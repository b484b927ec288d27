//! Driver for up to 128 WS2811/WS2812/WS2813 LED strips on 16 output lines.
//!
//! ## How the multiplexing works
//!
//! WS281x LEDs are daisy-chained and clocked by a single self-timed data line.
//! Every bit is a fixed-length pulse (1.25 µs at 800 kHz) whose high time
//! encodes a 0 or a 1, and a strip latches its new colors once the line stays
//! low for long enough. Driving many strips in parallel means generating many
//! such waveforms in lock-step.
//!
//! This crate drives 16 physical output lines and splits each of them across
//! 8 banks with an external shift register / demultiplexer, giving 128
//! independent strips:
//!
//! - **Lines**: a 16-bit port. Bit `n` of every transmit word is line `n`.
//! - **Banks**: for every wire bit the hardware shifts 8 consecutive words out
//!   to the 8 banks of each line before the strips see the bit.
//! - **Timer + DMA**: stream the transmit words to the port at the bit rate
//!   while the CPU keeps working.
//!
//! ### Transmit layout
//! Logical channel `c` lives on line `c / 8`, bank `7 - c % 8`. Each strip
//! position is a block of `24 × 8 = 192` words, one group of 8 per wire bit,
//! most significant bit first:
//!
//! ```text
//! position p: [ bit 0: bank0 .. bank7 ][ bit 1: bank0 .. bank7 ] .. [ bit 23 ]
//!   word    = p * 192 + bit * 8 + (7 - c % 8)
//!   line    = 1 << (c / 8)
//! ```
//!
//! A frame of `strip_len` positions is `strip_len × 384` bytes regardless of
//! how many channels are configured.
//!
//! ### Buffers
//! 1. **Draw buffer**: the application's pixels, channel-major.
//! 2. **Snapshot**: a copy taken at [`MultiWs2811::show`], so drawing can go on
//!    while a frame is being encoded.
//! 3. **Transmit buffer**: the bit-plane frame the DMA engine reads.
//!
//! ### Temporal dithering
//! With a [`DitherTable`] of `2^n` levels and [`Mode::ContinuousDither`], the
//! driver re-encodes the snapshot after every frame at the next dither phase
//! and sends it again without any call from the application. The eye averages
//! the sub-frames into more than 8 bits of depth per component.
//!
//! ## Platform integration
//! The crate never touches registers. The platform implements
//! [`SignalGenerator`] (arm a DMA transfer for a [`Chunk`]), places a
//! [`Shared`] where its interrupt handler can reach it, and calls
//! [`Shared::on_transfer_complete`] once per finished chunk. Frames longer than
//! the DMA engine can handle in one go are split into chunks of at most
//! [`MAX_TRANSFER_POSITIONS`] positions automatically.
//!
//! ## Available Feature Flags
//!
//! ### `defmt` Feature
//! Logs configuration, frame starts and transfer problems through `defmt` and
//! implements `defmt::Format` for the public types.
//!
//! ```toml
//! [dependencies]
//! multi-ws2811 = { version = "0.1.0", features = ["defmt"] }
//! ```
#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

#[macro_use]
mod fmt;

pub mod addressing;
pub mod driver;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod settings;

use embedded_graphics::pixelcolor::{Rgb888, RgbColor};

pub use addressing::{
    pixel_count, transmit_bytes, transmit_words, ChannelOrder, Geometry, MAX_CHANNELS,
};
pub use driver::{Buffers, Config, MultiWs2811};
pub use encoder::{DitherCycle, DitherTable, FrameEncoder};
pub use error::{BufferKind, ConfigurationError, Error, Result};
pub use pipeline::{Mode, Pipeline, Shared};
pub use scheduler::{Chunk, SignalGenerator, State, TransferScheduler, MAX_TRANSFER_POSITIONS};
pub use settings::{Clock, Protocol, Settings, SystemClock, Timing};

/// Color type used for pixels
pub type Color = Rgb888;

/// Pack components into a `0xRRGGBB` value.
#[must_use]
pub const fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

/// Convert a [`Color`] to `0xRRGGBB`.
#[must_use]
pub fn color_to_u32(color: Color) -> u32 {
    pack_rgb(color.r(), color.g(), color.b())
}

/// Convert `0xRRGGBB` to a [`Color`]. The top byte is ignored.
#[must_use]
pub const fn color_from_u32(rgb: u32) -> Color {
    Color::new((rgb >> 16) as u8, (rgb >> 8) as u8, rgb as u8)
}
