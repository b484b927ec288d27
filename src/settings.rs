//! Protocol timing, packed option flags and the time source.

use bitfield::bitfield;
use embassy_time::{Duration, Instant};

use crate::addressing::{ChannelOrder, BITS_PER_COLOR};
use crate::error::ConfigurationError;

/// Default minimum idle time between frames.
///
/// WS2811 parts latch after 50 µs, WS2812B and WS2813 need up to 300 µs; the
/// longer interval works for all of them.
pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_micros(300);

/// Default slack added to every chunk's completion budget.
pub const DEFAULT_STALL_MARGIN: Duration = Duration::from_millis(1);

/// LED protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    /// WS2811/WS2812 at 800 kHz. Nearly all strips.
    #[default]
    Ws2811Fast,
    /// WS2811 at 400 kHz.
    Ws2811Slow,
    /// WS2813 at 800 kHz.
    Ws2813,
}

impl Protocol {
    /// Flag value in the packed [`Settings`] byte.
    #[must_use]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Ws2811Fast => 0x00,
            Self::Ws2811Slow => 0x10,
            Self::Ws2813 => 0x20,
        }
    }

    /// Duration of one bit slot on the wire, in nanoseconds.
    #[must_use]
    pub const fn bit_period_ns(self) -> u32 {
        match self {
            Self::Ws2811Fast | Self::Ws2813 => 1250,
            Self::Ws2811Slow => 2500,
        }
    }
}

/// Timing parameters for the transfer scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    /// Duration of one bit slot, in nanoseconds.
    pub bit_period_ns: u32,
    /// Idle time required after a frame before the next may start.
    pub quiet_interval: Duration,
    /// Slack on top of twice the wire time before a chunk counts as stalled.
    pub stall_margin: Duration,
}

impl Timing {
    /// Defaults for a protocol.
    #[must_use]
    pub const fn for_protocol(protocol: Protocol) -> Self {
        Self {
            bit_period_ns: protocol.bit_period_ns(),
            quiet_interval: DEFAULT_QUIET_INTERVAL,
            stall_margin: DEFAULT_STALL_MARGIN,
        }
    }

    /// Time on the wire for `positions` strip positions.
    #[must_use]
    pub fn wire_time(&self, positions: usize) -> Duration {
        let nanos = positions as u64 * BITS_PER_COLOR as u64 * u64::from(self.bit_period_ns);
        Duration::from_micros(nanos.div_ceil(1000))
    }

    /// Longest a chunk of `positions` may stay armed before it counts as
    /// stalled.
    #[must_use]
    pub fn chunk_budget(&self, positions: usize) -> Duration {
        self.wire_time(positions) * 2 + self.stall_margin
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::for_protocol(Protocol::default())
    }
}

bitfield! {
    /// Packed option byte in the classic `WS2811_*` flag layout.
    ///
    /// - Bits 5-4: protocol (`0x00` 800 kHz, `0x10` 400 kHz, `0x20` WS2813)
    /// - Bits 2-0: channel order (`RGB = 0` .. `BGR = 5`)
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Settings(u8);
    impl Debug;
    pub u8, protocol_bits, set_protocol_bits: 5, 4;
    pub u8, order_bits, set_order_bits: 2, 0;
}

impl Settings {
    /// Build from typed values.
    #[must_use]
    pub fn new(order: ChannelOrder, protocol: Protocol) -> Self {
        let mut settings = Self(0);
        settings.set_order_bits(order as u8);
        settings.set_protocol_bits(protocol.flag() >> 4);
        settings
    }

    /// Raw flag byte.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Decoded channel order.
    ///
    /// # Errors
    /// [`ConfigurationError::ChannelOrder`] for order bits 6 and 7.
    pub fn order(&self) -> Result<ChannelOrder, ConfigurationError> {
        ChannelOrder::from_bits(self.order_bits())
    }

    /// Decoded protocol.
    ///
    /// # Errors
    /// [`ConfigurationError::Protocol`] for the unused `0x30` value.
    pub fn protocol(&self) -> Result<Protocol, ConfigurationError> {
        match self.protocol_bits() {
            0 => Ok(Protocol::Ws2811Fast),
            1 => Ok(Protocol::Ws2811Slow),
            2 => Ok(Protocol::Ws2813),
            other => Err(ConfigurationError::Protocol(other << 4)),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(ChannelOrder::default(), Protocol::default())
    }
}

impl From<u8> for Settings {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Settings {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Settings({=u8:#04x})", self.0);
    }
}

/// Monotonic time source.
///
/// Read from both the application and the completion context, so `now` must
/// not block.
pub trait Clock {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by the `embassy-time` driver of the platform.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}
