//! Bit-plane encoding of pixel frames.
//!
//! [`FrameEncoder`] turns a channel-major pixel array into the multiplexed
//! transmit layout described in [`crate::addressing`]. Each color component
//! first goes through a [`DitherTable`] level, then the channel order is
//! applied and the 24 wire bits are scattered into their words.
//!
//! # Temporal dithering
//! A dither table holds `2^bits` gamma-corrected variants of every 8-bit input.
//! Encoding the same frame at successive phases and sending the results back to
//! back lets the eye average them, which yields more than 8 bits of effective
//! depth per channel. [`DitherCycle`] hands out the phases.

use embedded_graphics::pixelcolor::RgbColor;

use crate::addressing::{
    bank_select, bit_location, physical_line, ChannelOrder, Geometry, BANKS_PER_LINE,
    BITS_PER_COLOR, MAX_CHANNELS, WORDS_PER_POSITION,
};
use crate::error::ConfigurationError;
use crate::Color;

const fn identity_level() -> [u8; 256] {
    let mut level = [0; 256];
    let mut i = 0;
    while i < 256 {
        level[i] = i as u8;
        i += 1;
    }
    level
}

static IDENTITY: [[u8; 256]; 1] = [identity_level()];

/// Gamma/dither lookup table: `levels[phase][value]`.
///
/// The table is supplied by the application; this crate never computes gamma
/// curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DitherTable<'a> {
    levels: &'a [[u8; 256]],
}

impl<'a> DitherTable<'a> {
    /// Wrap a table of `2^bits` levels.
    ///
    /// # Errors
    /// [`ConfigurationError::DitherLevels`] unless the level count is a power of
    /// two between 1 and 256.
    pub const fn new(levels: &'a [[u8; 256]]) -> Result<Self, ConfigurationError> {
        let count = levels.len();
        if count == 0 || count > 256 || !count.is_power_of_two() {
            return Err(ConfigurationError::DitherLevels { levels: count });
        }
        Ok(Self { levels })
    }

    /// Number of dither phases.
    #[must_use]
    pub const fn phases(&self) -> usize {
        self.levels.len()
    }

    /// Number of dither bits, `log2(phases())`.
    #[must_use]
    pub const fn dither_bits(&self) -> u32 {
        self.levels.len().trailing_zeros()
    }

    /// Corrected byte for `value` at `phase` (taken modulo the phase count).
    #[inline]
    #[must_use]
    pub fn correct(&self, phase: usize, value: u8) -> u8 {
        self.levels[phase & (self.levels.len() - 1)][usize::from(value)]
    }
}

impl DitherTable<'static> {
    /// Pass-through table with a single phase.
    #[must_use]
    pub const fn identity() -> Self {
        Self { levels: &IDENTITY }
    }
}

impl Default for DitherTable<'static> {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for DitherTable<'_> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "DitherTable {{ phases: {} }}", self.phases());
    }
}

/// Round-robin dither phase counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DitherCycle {
    phase: usize,
    phases: usize,
}

impl DitherCycle {
    /// Start at phase 0 of `phases` (a power of two).
    #[must_use]
    pub const fn new(phases: usize) -> Self {
        Self { phase: 0, phases }
    }

    /// Phase the next encode will use.
    #[must_use]
    pub const fn phase(&self) -> usize {
        self.phase
    }

    /// Return the current phase and step to the next one, wrapping.
    pub fn advance(&mut self) -> usize {
        let phase = self.phase;
        self.phase = (self.phase + 1) & (self.phases - 1);
        phase
    }
}

/// Encoder from pixels to the multiplexed bit-plane words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEncoder<'a> {
    geometry: Geometry,
    order: ChannelOrder,
    table: DitherTable<'a>,
}

impl<'a> FrameEncoder<'a> {
    /// Create an encoder.
    #[must_use]
    pub const fn new(geometry: Geometry, order: ChannelOrder, table: DitherTable<'a>) -> Self {
        Self {
            geometry,
            order,
            table,
        }
    }

    /// Geometry the encoder lays frames out for.
    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Wire channel order.
    #[must_use]
    pub const fn order(&self) -> ChannelOrder {
        self.order
    }

    /// Lookup table in use.
    #[must_use]
    pub const fn table(&self) -> DitherTable<'a> {
        self.table
    }

    /// The 24-bit value sent for `color` at `phase`, first wire byte in the
    /// top bits.
    #[inline]
    #[must_use]
    pub fn wire_value(&self, color: Color, phase: usize) -> u32 {
        let corrected = [
            self.table.correct(phase, color.r()),
            self.table.correct(phase, color.g()),
            self.table.correct(phase, color.b()),
        ];
        let [first, second, third] = self.order.apply(corrected);
        (u32::from(first) << 16) | (u32::from(second) << 8) | u32::from(third)
    }

    /// Encode a whole frame at `phase`.
    ///
    /// `pixels` is channel-major (`channel * strip_len + position`) and must
    /// hold at least `pixel_count()` entries; `transmit` at least
    /// `transmit_words()`. Only the bits of configured channels are written, so
    /// lines without a configured channel keep whatever they held (zero after
    /// configuration). Running twice with the same inputs gives identical
    /// output.
    pub fn encode(&self, pixels: &[Color], phase: usize, transmit: &mut [u16]) {
        let strip_len = self.geometry.strip_len();
        let channels = self.geometry.channel_count();
        let blocks = transmit[..self.geometry.transmit_words()].chunks_exact_mut(WORDS_PER_POSITION);

        for (position, block) in blocks.enumerate() {
            for channel in 0..channels {
                let value = self.wire_value(pixels[channel * strip_len + position], phase);
                write_bits(block, bank_select(channel), 1 << physical_line(channel), value);
            }
        }
    }

    /// Encode a single pixel into an existing frame.
    ///
    /// # Panics
    /// If `channel >= MAX_CHANNELS` or `transmit` ends before `position`.
    pub fn encode_pixel(
        &self,
        transmit: &mut [u16],
        channel: usize,
        position: usize,
        color: Color,
        phase: usize,
    ) {
        assert!(channel < MAX_CHANNELS, "channel has no output line");
        let value = self.wire_value(color, phase);
        let start = position * WORDS_PER_POSITION;
        write_bits(
            &mut transmit[start..start + WORDS_PER_POSITION],
            bank_select(channel),
            1 << physical_line(channel),
            value,
        );
    }

    /// Read one pixel back out of an encoded frame.
    ///
    /// The channel order is undone; lookup-table correction is not.
    ///
    /// # Panics
    /// If `channel >= MAX_CHANNELS` or `transmit` ends before `position`.
    #[must_use]
    pub fn decode_pixel(&self, transmit: &[u16], channel: usize, position: usize) -> Color {
        let mut value = 0u32;
        for bit in 0..BITS_PER_COLOR {
            let location = bit_location(channel, position, bit);
            value <<= 1;
            value |= u32::from(transmit[location.word] & location.line_mask != 0);
        }
        let wire = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
        self.order.color_from_wire(wire)
    }
}

/// Scatter a 24-bit value over one position block, touching only `mask`.
#[inline]
fn write_bits(block: &mut [u16], slot: usize, mask: u16, value: u32) {
    for (bit, word) in block[slot..]
        .iter_mut()
        .step_by(BANKS_PER_LINE)
        .take(BITS_PER_COLOR)
        .enumerate()
    {
        let fill = 0u16.wrapping_sub(((value >> (BITS_PER_COLOR - 1 - bit)) & 1) as u16);
        *word = (*word & !mask) | (fill & mask);
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for FrameEncoder<'_> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "FrameEncoder {{ geometry: {}, order: {}, table: {} }}",
            self.geometry,
            self.order,
            self.table
        );
    }
}
