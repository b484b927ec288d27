//! Chunked transfer scheduling.
//!
//! The DMA engine can only address a limited number of elements per arm, so a
//! frame is streamed as a series of chunks of at most `max_chunk` strip
//! positions. The [`TransferScheduler`] tracks which chunk is in flight,
//! re-arms the [`SignalGenerator`] on every completion event and enforces the
//! idle time the LEDs need to latch a frame before the next one may start.
//!
//! ```text
//!            publish, quiet elapsed
//!   Idle ─────────────────────────────► Armed(0) ──complete──► Armed(n) ─┐
//!    │  ▲                                                        ▲       │
//!    │  └──────────────── last chunk complete ───────────────────┼───────┘
//!    │ publish, still quiet                                      │
//!    └──────────► AwaitingQuietPeriod ──── quiet elapsed ────────┘
//! ```
//!
//! Every transition is a plain method call that never blocks, so the
//! completion handler can run in interrupt context.

use core::ops::Range;

use embassy_time::{Duration, Instant};
use embedded_dma::ReadBuffer;

use crate::addressing::WORDS_PER_POSITION;
use crate::error::{ConfigurationError, Error};
use crate::settings::Timing;

/// Largest chunk, in strip positions, the reference DMA engine accepts.
///
/// `170 * 192 = 32640` 16-bit transfers, just below the engine's 15-bit
/// iteration counter.
pub const MAX_TRANSFER_POSITIONS: usize = 170;

/// One chunk of the transmit buffer handed to the [`SignalGenerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    words: &'a [u16],
    first_position: usize,
}

impl<'a> Chunk<'a> {
    /// The encoded words to stream out, in order.
    #[must_use]
    pub const fn words(&self) -> &'a [u16] {
        self.words
    }

    /// Number of DMA elements (16-bit words) in the chunk.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the chunk has no words. Never true for scheduled chunks.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Strip positions covered by this chunk.
    #[must_use]
    pub const fn positions(&self) -> Range<usize> {
        self.first_position..self.first_position + self.words.len() / WORDS_PER_POSITION
    }

    /// Whether this chunk starts a new frame.
    #[must_use]
    pub const fn starts_frame(&self) -> bool {
        self.first_position == 0
    }
}

unsafe impl ReadBuffer for Chunk<'_> {
    type Word = u16;

    unsafe fn read_buffer(&self) -> (*const u16, usize) {
        (self.words.as_ptr(), self.words.len())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Chunk<'_> {
    fn format(&self, f: defmt::Formatter) {
        let positions = self.positions();
        defmt::write!(f, "Chunk {{ positions: {}..{} }}", positions.start, positions.end);
    }
}

/// The hardware layer that turns transmit words into wire signals.
///
/// Implementations start streaming the chunk from `arm` and return
/// immediately. Exactly once per armed chunk, strictly after its last word has
/// left the wire, the platform must call
/// [`Shared::on_transfer_complete`](crate::Shared::on_transfer_complete).
/// The words stay untouched until then.
pub trait SignalGenerator {
    /// Start streaming `chunk`.
    fn arm(&mut self, chunk: Chunk<'_>);

    /// Ask for a call to
    /// [`Shared::on_quiet_elapsed`](crate::Shared::on_quiet_elapsed) after
    /// `delay`.
    ///
    /// Continuous mode relies on this callback to start every refresh frame,
    /// since each one is published while the previous frame is still
    /// latching. A one-shot hardware timer is enough; calling back later than
    /// `delay` only delays the frame.
    fn schedule_quiet_timer(&mut self, delay: Duration);
}

impl<G: SignalGenerator + ?Sized> SignalGenerator for &mut G {
    fn arm(&mut self, chunk: Chunk<'_>) {
        (**self).arm(chunk);
    }

    fn schedule_quiet_timer(&mut self, delay: Duration) {
        (**self).schedule_quiet_timer(delay);
    }
}

/// The chunk currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferCursor {
    /// First strip position of the chunk.
    pub start: usize,
    /// Number of positions in the chunk.
    pub len: usize,
    /// When the chunk was armed.
    pub armed_at: Instant,
}

impl TransferCursor {
    /// Position just past this chunk.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Nothing in flight, nothing queued.
    Idle,
    /// A chunk is in flight.
    Armed(TransferCursor),
    /// A frame is queued until the quiet interval has passed.
    AwaitingQuietPeriod,
}

/// Outcome of [`TransferScheduler::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Schedule {
    /// The first chunk was armed.
    Armed,
    /// The frame waits for the quiet interval; the remaining time is attached.
    Deferred(Duration),
    /// A transfer is already in flight; nothing changed.
    InFlight,
}

/// Outcome of [`TransferScheduler::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Completion {
    /// The next chunk of the same frame was armed.
    Rearmed(TransferCursor),
    /// The last chunk finished; the scheduler is idle.
    FrameDone,
    /// No chunk was in flight; the event was ignored.
    Spurious,
}

/// State machine splitting frames into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferScheduler {
    total: usize,
    max_chunk: usize,
    timing: Timing,
    state: State,
    last_completion: Option<Instant>,
}

impl TransferScheduler {
    /// Scheduler for frames of `total` positions.
    ///
    /// # Errors
    /// [`ConfigurationError::EmptyStrip`] for `total == 0`,
    /// [`ConfigurationError::EmptyChunk`] for `max_chunk == 0`.
    pub const fn new(
        total: usize,
        max_chunk: usize,
        timing: Timing,
    ) -> Result<Self, ConfigurationError> {
        if total == 0 {
            return Err(ConfigurationError::EmptyStrip);
        }
        if max_chunk == 0 {
            return Err(ConfigurationError::EmptyChunk);
        }
        Ok(Self {
            total,
            max_chunk,
            timing,
            state: State::Idle,
            last_completion: None,
        })
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    /// Frame length in positions.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Largest chunk in positions.
    #[must_use]
    pub const fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Timing parameters.
    #[must_use]
    pub const fn timing(&self) -> Timing {
        self.timing
    }

    /// When the last frame finished, if any has.
    #[must_use]
    pub const fn last_completion(&self) -> Option<Instant> {
        self.last_completion
    }

    /// Whether a chunk is in flight.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        matches!(self.state, State::Armed(_))
    }

    /// Time left before a new frame may start.
    #[must_use]
    pub fn quiet_remaining(&self, now: Instant) -> Duration {
        match self.last_completion {
            Some(done) => {
                let elapsed = now.saturating_duration_since(done);
                self.timing
                    .quiet_interval
                    .checked_sub(elapsed)
                    .unwrap_or(Duration::from_ticks(0))
            }
            None => Duration::from_ticks(0),
        }
    }

    /// True unless idle and past the quiet interval.
    #[must_use]
    pub fn is_busy(&self, now: Instant) -> bool {
        self.state != State::Idle || self.quiet_remaining(now) > Duration::from_ticks(0)
    }

    /// Queue a freshly encoded frame.
    ///
    /// Arms the first chunk right away when the quiet interval has passed.
    /// Publishing while already waiting keeps the frame queued and reports the
    /// remaining wait again.
    pub fn publish<G: SignalGenerator>(
        &mut self,
        now: Instant,
        generator: &mut G,
        transmit: &[u16],
    ) -> Schedule {
        match self.state {
            State::Armed(_) => Schedule::InFlight,
            State::Idle | State::AwaitingQuietPeriod => {
                let remaining = self.quiet_remaining(now);
                if remaining > Duration::from_ticks(0) {
                    self.state = State::AwaitingQuietPeriod;
                    Schedule::Deferred(remaining)
                } else {
                    self.arm(0, now, generator, transmit);
                    Schedule::Armed
                }
            }
        }
    }

    /// Start a queued frame once the quiet interval has passed.
    ///
    /// Returns true if the first chunk was armed by this call.
    pub fn poll<G: SignalGenerator>(
        &mut self,
        now: Instant,
        generator: &mut G,
        transmit: &[u16],
    ) -> bool {
        if self.state == State::AwaitingQuietPeriod
            && self.quiet_remaining(now) == Duration::from_ticks(0)
        {
            self.arm(0, now, generator, transmit);
            true
        } else {
            false
        }
    }

    /// Handle a completion event from the signal generator.
    pub fn complete<G: SignalGenerator>(
        &mut self,
        now: Instant,
        generator: &mut G,
        transmit: &[u16],
    ) -> Completion {
        let State::Armed(cursor) = self.state else {
            return Completion::Spurious;
        };
        if cursor.end() < self.total {
            let next = self.arm(cursor.end(), now, generator, transmit);
            Completion::Rearmed(next)
        } else {
            self.state = State::Idle;
            self.last_completion = Some(now);
            Completion::FrameDone
        }
    }

    /// Report a chunk that has outlived its completion budget.
    ///
    /// # Errors
    /// [`Error::TransferStall`] while the armed chunk is overdue.
    pub fn check_stall(&self, now: Instant) -> Result<(), Error> {
        if let State::Armed(cursor) = self.state {
            let waited = now.saturating_duration_since(cursor.armed_at);
            if waited > self.timing.chunk_budget(cursor.len) {
                return Err(Error::TransferStall {
                    start: cursor.start,
                    len: cursor.len,
                    waited_us: waited.as_micros(),
                });
            }
        }
        Ok(())
    }

    /// Abandon whatever is in flight or queued.
    ///
    /// The quiet interval restarts at `now`, since the wire state of an
    /// abandoned transfer is unknown. Returns the state that was dropped.
    pub fn abort(&mut self, now: Instant) -> State {
        let dropped = self.state;
        self.state = State::Idle;
        self.last_completion = Some(now);
        dropped
    }

    fn arm<G: SignalGenerator>(
        &mut self,
        start: usize,
        now: Instant,
        generator: &mut G,
        transmit: &[u16],
    ) -> TransferCursor {
        let len = (self.total - start).min(self.max_chunk);
        let cursor = TransferCursor {
            start,
            len,
            armed_at: now,
        };
        self.state = State::Armed(cursor);
        generator.arm(Chunk {
            words: &transmit[start * WORDS_PER_POSITION..cursor.end() * WORDS_PER_POSITION],
            first_position: start,
        });
        cursor
    }
}
