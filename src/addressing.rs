//! Mapping from logical strips to the multiplexed bit-plane layout.
//!
//! Every strip position owns one block of [`WORDS_PER_POSITION`] 16-bit words
//! in the transmit buffer. Inside a block, the 24 color bits follow each other
//! MSB first, and every color bit is spread over [`BANKS_PER_LINE`]
//! consecutive words, one per bank. Bit `n` of such a word is the level of
//! physical output line `n` while that bank is selected:
//!
//! ```text
//! word = position * 192 + bit * 8 + bank_select(channel)
//! mask = 1 << physical_line(channel)
//! ```
//!
//! The bank slot is reversed (`7 - channel % 8`) because the shift register
//! clocks the first word out to the last bank.

use embedded_graphics::pixelcolor::RgbColor;

use crate::error::{ConfigurationError, Error};
use crate::Color;

/// Number of physical output lines, one bit of every transmit word each.
pub const PHYSICAL_LINES: usize = 16;

/// Number of banks time-multiplexed onto each physical line.
pub const BANKS_PER_LINE: usize = 8;

/// Largest number of logical channels the layout can address.
pub const MAX_CHANNELS: usize = PHYSICAL_LINES * BANKS_PER_LINE;

/// Color bits sent per LED.
pub const BITS_PER_COLOR: usize = 24;

/// Transmit words occupied by one strip position across all channels.
pub const WORDS_PER_POSITION: usize = BITS_PER_COLOR * BANKS_PER_LINE;

/// Transmit bytes occupied by one strip position across all channels.
pub const BYTES_PER_POSITION: usize = WORDS_PER_POSITION * core::mem::size_of::<u16>();

/// Physical output line (`0..16`) a channel is wired to.
#[inline]
#[must_use]
pub const fn physical_line(channel: usize) -> usize {
    channel / BANKS_PER_LINE
}

/// Bank slot (`0..8`) a channel occupies within each color bit.
#[inline]
#[must_use]
pub const fn bank_select(channel: usize) -> usize {
    BANKS_PER_LINE - 1 - (channel % BANKS_PER_LINE)
}

/// Inverse of [`physical_line`] and [`bank_select`].
#[inline]
#[must_use]
pub const fn channel_of(line: usize, bank: usize) -> usize {
    line * BANKS_PER_LINE + (BANKS_PER_LINE - 1 - bank)
}

/// Storage location of a single color bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Location {
    /// Index of the 16-bit word in the transmit buffer.
    pub word: usize,
    /// Single-bit mask selecting the channel's physical line in that word.
    pub line_mask: u16,
}

/// Locate color bit `bit` (0 = MSB of the 24-bit wire value) of `channel` at
/// `position`.
///
/// Pure arithmetic; callers are expected to have validated the position
/// against a [`Geometry`].
///
/// # Panics
/// If `channel >= MAX_CHANNELS`, which has no output line.
#[inline]
#[must_use]
pub const fn bit_location(channel: usize, position: usize, bit: usize) -> Location {
    assert!(channel < MAX_CHANNELS, "channel has no output line");
    Location {
        word: position * WORDS_PER_POSITION + bit * BANKS_PER_LINE + bank_select(channel),
        line_mask: 1 << physical_line(channel),
    }
}

/// Recover `(channel, position, bit)` from a word index and physical line.
///
/// Exact inverse of [`bit_location`].
#[inline]
#[must_use]
pub const fn locate(word: usize, line: usize) -> (usize, usize, usize) {
    let position = word / WORDS_PER_POSITION;
    let within = word % WORDS_PER_POSITION;
    let bit = within / BANKS_PER_LINE;
    let bank = within % BANKS_PER_LINE;
    (channel_of(line, bank), position, bit)
}

/// Number of pixels addressable for a geometry: `channel_count × strip_len`.
#[must_use]
pub const fn pixel_count(strip_len: usize, channel_count: usize) -> usize {
    strip_len * channel_count
}

/// Number of `u16` transmit words needed for a strip length.
#[must_use]
pub const fn transmit_words(strip_len: usize) -> usize {
    strip_len * WORDS_PER_POSITION
}

/// Number of transmit bytes needed for a strip length.
#[must_use]
pub const fn transmit_bytes(strip_len: usize) -> usize {
    strip_len * BYTES_PER_POSITION
}

/// Validated strip length and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    strip_len: usize,
    channel_count: usize,
}

impl Geometry {
    /// Validate a geometry.
    ///
    /// # Errors
    /// [`ConfigurationError::EmptyStrip`] for a zero strip length and
    /// [`ConfigurationError::ChannelCount`] unless `1 <= channel_count <= 128`.
    pub const fn new(strip_len: usize, channel_count: usize) -> Result<Self, ConfigurationError> {
        if strip_len == 0 {
            return Err(ConfigurationError::EmptyStrip);
        }
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(ConfigurationError::ChannelCount {
                count: channel_count,
                max: MAX_CHANNELS,
            });
        }
        Ok(Self {
            strip_len,
            channel_count,
        })
    }

    /// LEDs per strip.
    #[must_use]
    pub const fn strip_len(&self) -> usize {
        self.strip_len
    }

    /// Number of configured logical channels.
    #[must_use]
    pub const fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Total addressable pixels, `channel_count × strip_len`.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        pixel_count(self.strip_len, self.channel_count)
    }

    /// Transmit buffer length in words.
    #[must_use]
    pub const fn transmit_words(&self) -> usize {
        transmit_words(self.strip_len)
    }

    /// Flat draw-buffer index of a pixel.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] when either coordinate is outside the geometry.
    pub const fn pixel_index(&self, channel: usize, position: usize) -> Result<usize, Error> {
        if channel >= self.channel_count || position >= self.strip_len {
            return Err(Error::OutOfRange { channel, position });
        }
        Ok(channel * self.strip_len + position)
    }

    /// Split a flat pixel index into `(channel, position)`.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] when `index >= pixel_count()`.
    pub const fn split_index(&self, index: usize) -> Result<(usize, usize), Error> {
        let channel = index / self.strip_len;
        let position = index % self.strip_len;
        if channel >= self.channel_count {
            return Err(Error::OutOfRange { channel, position });
        }
        Ok((channel, position))
    }
}

/// Order in which the three color components go out on the wire.
///
/// The discriminants match the classic `WS2811_RGB .. WS2811_BGR` flag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChannelOrder {
    /// Red, green, blue. The order the WS2811 datasheet documents.
    Rgb = 0,
    /// Red, blue, green.
    Rbg = 1,
    /// Green, red, blue. Most strips are wired this way.
    #[default]
    Grb = 2,
    /// Green, blue, red.
    Gbr = 3,
    /// Blue, red, green.
    Brg = 4,
    /// Blue, green, red.
    Bgr = 5,
}

impl ChannelOrder {
    /// All six orders.
    pub const ALL: [Self; 6] = [
        Self::Rgb,
        Self::Rbg,
        Self::Grb,
        Self::Gbr,
        Self::Brg,
        Self::Bgr,
    ];

    /// Decode a flag value.
    ///
    /// # Errors
    /// [`ConfigurationError::ChannelOrder`] for values above 5.
    pub const fn from_bits(bits: u8) -> Result<Self, ConfigurationError> {
        match bits {
            0 => Ok(Self::Rgb),
            1 => Ok(Self::Rbg),
            2 => Ok(Self::Grb),
            3 => Ok(Self::Gbr),
            4 => Ok(Self::Brg),
            5 => Ok(Self::Bgr),
            other => Err(ConfigurationError::ChannelOrder(other)),
        }
    }

    /// Index into `[r, g, b]` for each wire slot.
    const fn slots(self) -> [usize; 3] {
        match self {
            Self::Rgb => [0, 1, 2],
            Self::Rbg => [0, 2, 1],
            Self::Grb => [1, 0, 2],
            Self::Gbr => [1, 2, 0],
            Self::Brg => [2, 0, 1],
            Self::Bgr => [2, 1, 0],
        }
    }

    /// Permute logical `[r, g, b]` into wire order.
    #[inline]
    #[must_use]
    pub const fn apply(self, rgb: [u8; 3]) -> [u8; 3] {
        let slots = self.slots();
        [rgb[slots[0]], rgb[slots[1]], rgb[slots[2]]]
    }

    /// Undo [`ChannelOrder::apply`].
    #[inline]
    #[must_use]
    pub const fn restore(self, wire: [u8; 3]) -> [u8; 3] {
        let slots = self.slots();
        let mut rgb = [0; 3];
        rgb[slots[0]] = wire[0];
        rgb[slots[1]] = wire[1];
        rgb[slots[2]] = wire[2];
        rgb
    }

    /// Wire bytes for a color.
    #[inline]
    #[must_use]
    pub fn wire_bytes(self, color: Color) -> [u8; 3] {
        self.apply([color.r(), color.g(), color.b()])
    }

    /// Color back from wire bytes.
    #[inline]
    #[must_use]
    pub fn color_from_wire(self, wire: [u8; 3]) -> Color {
        let [r, g, b] = self.restore(wire);
        Color::new(r, g, b)
    }
}
