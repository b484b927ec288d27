//! Error types for the driver.

use derive_more::{Display, Error as DeriveError};

/// Reasons a driver configuration is rejected.
///
/// Configuration errors are fatal: no buffer is touched and nothing is
/// installed when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, DeriveError)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigurationError {
    /// The strip length must be at least one LED.
    #[display("strip length must be at least 1")]
    EmptyStrip,
    /// The channel count must lie in `1..=MAX_CHANNELS`.
    #[display("channel count {count} outside 1..={max}")]
    ChannelCount {
        /// Requested channel count.
        count: usize,
        /// Largest supported channel count.
        max: usize,
    },
    /// A buffer is smaller than the geometry requires.
    #[display("{buffer} buffer holds {actual} elements, {required} required")]
    BufferTooSmall {
        /// Which buffer was rejected.
        buffer: BufferKind,
        /// Elements required by the geometry.
        required: usize,
        /// Elements provided.
        actual: usize,
    },
    /// Continuous mode re-encodes autonomously and needs its own snapshot.
    #[display("continuous mode requires a snapshot buffer")]
    MissingSnapshot,
    /// The maximum chunk size must be at least one position.
    #[display("maximum chunk length must be at least 1")]
    EmptyChunk,
    /// Dither tables need a power-of-two number of levels, at most 256.
    #[display("dither table has {levels} levels, expected a power of two up to 256")]
    DitherLevels {
        /// Number of levels provided.
        levels: usize,
    },
    /// The packed settings byte names an unknown channel order.
    #[display("unknown channel order {_0}")]
    ChannelOrder(#[error(not(source))] u8),
    /// The packed settings byte names an unknown protocol.
    #[display("unknown protocol {_0:#04x}")]
    Protocol(#[error(not(source))] u8),
    /// The shared pipeline cell already holds a configured driver.
    #[display("pipeline already configured")]
    AlreadyConfigured,
    /// The shared pipeline cell is empty.
    #[display("pipeline not configured")]
    NotConfigured,
}

/// The buffer a [`ConfigurationError::BufferTooSmall`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferKind {
    /// Application draw buffer.
    #[display("draw")]
    Draw,
    /// Copy snapshot.
    #[display("snapshot")]
    Snapshot,
    /// Bit-plane transmit buffer.
    #[display("transmit")]
    Transmit,
}

/// Errors reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, DeriveError)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Bad geometry or buffer sizes at setup.
    #[display("configuration error: {_0}")]
    Configuration(#[error(source)] ConfigurationError),
    /// A pixel address beyond the configured geometry.
    #[display("pixel out of range: channel {channel}, position {position}")]
    OutOfRange {
        /// Requested channel.
        channel: usize,
        /// Requested position along the strip.
        position: usize,
    },
    /// The signal generator did not report completion within the chunk budget.
    #[display("transfer of {len} positions at {start} stalled after {waited_us} us")]
    TransferStall {
        /// First position of the stalled chunk.
        start: usize,
        /// Number of positions in the stalled chunk.
        len: usize,
        /// Microseconds since the chunk was armed.
        waited_us: u64,
    },
}

impl From<ConfigurationError> for Error {
    fn from(error: ConfigurationError) -> Self {
        Self::Configuration(error)
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;
