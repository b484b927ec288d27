//! State shared between the application and the completion context.
//!
//! Everything the completion handler touches lives in one [`Pipeline`]: the
//! transfer scheduler, the transmit buffer, the copy snapshot, the dither
//! cycle, the signal generator and the clock. The pipeline sits in a
//! [`Shared`] cell guarded by a `critical-section` mutex. Both contexts only
//! ever hold it for one non-blocking step; waiting happens outside it.
//!
//! Application-side encoding happens with interrupts enabled. While nothing
//! is armed, `show` takes the transmit buffer and snapshot out of the pipeline
//! as a [`Lease`], encodes them, and hands them back to be published. Events
//! that arrive in between find no buffer and leave the scheduler waiting.
//!
//! # Modes
//! - [`Mode::Direct`]: every `show` waits for the wire, encodes the draw buffer
//!   (through the snapshot when one is configured) and starts one transfer.
//! - [`Mode::ContinuousDither`]: `show` only copies the draw buffer into the
//!   snapshot. Each completed frame is followed by a re-encode of the snapshot
//!   at the next dither phase, so the strips refresh on their own.
//!
//! A published frame is never dropped: until it has started on the wire the
//! pipeline reports it as queued and refuses to overwrite it.

use core::cell::RefCell;

use critical_section::Mutex;
use embassy_time::Instant;

use crate::encoder::{DitherCycle, FrameEncoder};
use crate::error::{ConfigurationError, Error};
use crate::scheduler::{Completion, Schedule, SignalGenerator, State, TransferScheduler};
use crate::settings::Clock;
use crate::Color;

/// How frames reach the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// One transfer per `show`, always dither phase 0.
    #[default]
    Direct,
    /// Continuous refresh from the snapshot, advancing the dither phase every
    /// frame.
    ContinuousDither,
}

/// Buffers, scheduler and hardware handle driven from both contexts.
pub struct Pipeline<'a, G, K> {
    encoder: FrameEncoder<'a>,
    scheduler: TransferScheduler,
    cycle: DitherCycle,
    transmit: Option<&'a mut [u16]>,
    snapshot: Option<&'a mut [Color]>,
    generator: G,
    clock: K,
    mode: Mode,
    queued: bool,
    loaded: bool,
    phase: usize,
    frames: u32,
}

impl<'a, G, K> Pipeline<'a, G, K>
where
    G: SignalGenerator,
    K: Clock,
{
    pub(crate) fn new(
        encoder: FrameEncoder<'a>,
        scheduler: TransferScheduler,
        mode: Mode,
        transmit: &'a mut [u16],
        snapshot: Option<&'a mut [Color]>,
        generator: G,
        clock: K,
    ) -> Self {
        Self {
            cycle: DitherCycle::new(encoder.table().phases()),
            encoder,
            scheduler,
            transmit: Some(transmit),
            snapshot,
            generator,
            clock,
            mode,
            queued: false,
            loaded: false,
            phase: 0,
            frames: 0,
        }
    }

    /// Current time from the pipeline's clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Operating mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Transfer scheduler state.
    #[must_use]
    pub const fn scheduler(&self) -> &TransferScheduler {
        &self.scheduler
    }

    /// Encoder configuration.
    #[must_use]
    pub const fn encoder(&self) -> &FrameEncoder<'a> {
        &self.encoder
    }

    /// The signal generator.
    #[must_use]
    pub const fn generator(&self) -> &G {
        &self.generator
    }

    /// Mutable access to the signal generator, e.g. to acknowledge an
    /// interrupt before reporting completion.
    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    /// Encoded frame as the signal generator sees it.
    ///
    /// Empty while `show` is encoding a new frame.
    #[must_use]
    pub fn transmit(&self) -> &[u16] {
        self.transmit.as_deref().unwrap_or(&[])
    }

    /// Last published snapshot, if a snapshot buffer is configured.
    #[must_use]
    pub fn snapshot(&self) -> Option<&[Color]> {
        self.snapshot.as_deref()
    }

    /// Dither phase the transmit buffer was encoded at.
    #[must_use]
    pub const fn dither_phase(&self) -> usize {
        self.phase
    }

    /// Number of frames that finished on the wire.
    #[must_use]
    pub const fn frames_completed(&self) -> u32 {
        self.frames
    }

    /// Whether a published frame has not started transmitting yet.
    #[must_use]
    pub const fn is_queued(&self) -> bool {
        self.queued
    }

    /// Wire busy, quiet interval running, or a published frame still queued.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.queued || self.scheduler.is_busy(self.clock.now())
    }

    /// Report an overdue chunk.
    ///
    /// # Errors
    /// [`Error::TransferStall`] while the armed chunk is past its budget.
    pub fn check_stall(&self) -> Result<(), Error> {
        self.scheduler.check_stall(self.clock.now())
    }

    /// Drop the in-flight or queued transfer and return to idle.
    ///
    /// Meant for recovering from a stalled signal generator. A queued frame
    /// is discarded; the quiet interval restarts now.
    pub fn abort(&mut self) -> State {
        let now = self.clock.now();
        self.queued = false;
        let dropped = self.scheduler.abort(now);
        warn!("transfer aborted");
        dropped
    }

    /// Completion event from the signal generator.
    ///
    /// Never blocks. In continuous mode a finished frame is followed by a
    /// re-encode of the snapshot and a new publish.
    pub fn on_transfer_complete(&mut self) {
        let Some(transmit) = self.transmit.as_deref() else {
            warn!("completion event while a frame is being encoded");
            return;
        };
        let now = self.clock.now();
        match self.scheduler.complete(now, &mut self.generator, transmit) {
            Completion::Rearmed(cursor) => {
                trace!("rearmed positions {}..{}", cursor.start, cursor.end());
            }
            Completion::FrameDone => {
                self.frames = self.frames.wrapping_add(1);
                if self.mode == Mode::ContinuousDither && self.loaded {
                    self.encode_snapshot();
                    self.start();
                }
            }
            Completion::Spurious => {
                warn!("completion event without an armed chunk");
            }
        }
    }

    /// Quiet-interval timer event.
    pub fn on_quiet_elapsed(&mut self) {
        self.poll();
    }

    /// Start a queued frame if its quiet interval is over.
    pub(crate) fn poll(&mut self) -> bool {
        let Some(transmit) = self.transmit.as_deref() else {
            return false;
        };
        let now = self.clock.now();
        let armed = self.scheduler.poll(now, &mut self.generator, transmit);
        if armed {
            self.queued = false;
            debug!("frame started after quiet interval, phase {}", self.phase);
        }
        armed
    }

    /// One step of a direct-mode `show`.
    ///
    /// Waits while the previous frame is still in flight or queued; otherwise
    /// lends out the buffers for encoding at phase 0.
    pub(crate) fn try_publish_direct(&mut self) -> Result<Publish<'a>, Error> {
        self.poll();
        if self.queued || self.scheduler.is_armed() {
            self.check_stall()?;
            return Ok(Publish::Wait);
        }
        Ok(self.lease().map_or(Publish::Wait, Publish::Encode))
    }

    /// One step of a continuous-mode `show`.
    ///
    /// Waits while the previously published snapshot has not started
    /// transmitting. With a chunk in flight the snapshot is replaced here and
    /// left for the completion handler; otherwise the buffers are lent out
    /// for encoding at the next dither phase.
    pub(crate) fn try_publish_continuous(
        &mut self,
        draw: &[Color],
    ) -> Result<Publish<'a>, Error> {
        if self.transmit.is_some() && self.snapshot.is_none() {
            return Err(ConfigurationError::MissingSnapshot.into());
        }
        self.poll();
        if self.queued {
            self.check_stall()?;
            return Ok(Publish::Wait);
        }
        if self.scheduler.is_armed() {
            if let Some(snapshot) = self.snapshot.as_deref_mut() {
                snapshot.copy_from_slice(draw);
            }
            self.loaded = true;
            self.queued = true;
            return Ok(Publish::Queued);
        }
        let Some(mut lease) = self.lease() else {
            return Ok(Publish::Wait);
        };
        lease.phase = self.cycle.advance();
        Ok(Publish::Encode(lease))
    }

    /// Take back encoded buffers and publish them.
    pub(crate) fn restore(&mut self, lease: Lease<'a>) {
        self.transmit = Some(lease.transmit);
        self.snapshot = lease.snapshot;
        self.phase = lease.phase;
        self.loaded = true;
        self.queued = true;
        self.start();
    }

    /// One step of waiting for a queued frame to start.
    pub(crate) fn try_settle(&mut self) -> Result<bool, Error> {
        self.poll();
        if self.queued {
            self.check_stall()?;
            return Ok(false);
        }
        Ok(true)
    }

    fn lease(&mut self) -> Option<Lease<'a>> {
        let transmit = self.transmit.take()?;
        Some(Lease {
            encoder: self.encoder,
            transmit,
            snapshot: self.snapshot.take(),
            phase: 0,
        })
    }

    fn encode_snapshot(&mut self) {
        let (Some(snapshot), Some(transmit)) =
            (self.snapshot.as_deref(), self.transmit.as_deref_mut())
        else {
            return;
        };
        let phase = self.cycle.advance();
        self.encoder.encode(snapshot, phase, transmit);
        self.phase = phase;
    }

    fn start(&mut self) {
        let Some(transmit) = self.transmit.as_deref() else {
            return;
        };
        let now = self.clock.now();
        match self.scheduler.publish(now, &mut self.generator, transmit) {
            Schedule::Armed => {
                self.queued = false;
                debug!("frame started, phase {}", self.phase);
            }
            Schedule::Deferred(remaining) => {
                self.generator.schedule_quiet_timer(remaining);
            }
            Schedule::InFlight => {}
        }
    }
}

/// Transmit buffer and snapshot on loan to `show` for encoding.
pub(crate) struct Lease<'a> {
    encoder: FrameEncoder<'a>,
    transmit: &'a mut [u16],
    snapshot: Option<&'a mut [Color]>,
    phase: usize,
}

impl Lease<'_> {
    /// Copy `draw` into the snapshot, if there is one, and encode it.
    pub(crate) fn encode(&mut self, draw: &[Color]) {
        match self.snapshot.as_deref_mut() {
            Some(snapshot) => {
                snapshot.copy_from_slice(draw);
                self.encoder.encode(snapshot, self.phase, self.transmit);
            }
            None => self.encoder.encode(draw, self.phase, self.transmit),
        }
    }
}

/// Outcome of one publish step.
pub(crate) enum Publish<'a> {
    /// The previous frame has not started or finished yet.
    Wait,
    /// Encode the lease and hand it to [`Pipeline::restore`].
    Encode(Lease<'a>),
    /// The snapshot was replaced; the completion handler encodes it.
    Queued,
}

impl<G, K> core::fmt::Debug for Pipeline<'_, G, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("mode", &self.mode)
            .field("state", &self.scheduler.state())
            .field("queued", &self.queued)
            .field("phase", &self.phase)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "defmt")]
impl<G, K> defmt::Format for Pipeline<'_, G, K> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "Pipeline {{ mode: {}, state: {}, queued: {}, phase: {}, frames: {} }}",
            self.mode,
            self.scheduler.state(),
            self.queued,
            self.phase,
            self.frames
        );
    }
}

/// Interrupt-safe home of a [`Pipeline`].
///
/// Place one in a `static` (or anywhere that outlives the driver), hand it to
/// [`MultiWs2811::configure`](crate::MultiWs2811::configure), and call
/// [`on_transfer_complete`](Self::on_transfer_complete) from the DMA completion
/// interrupt and [`on_quiet_elapsed`](Self::on_quiet_elapsed) from the quiet
/// timer.
pub struct Shared<'a, G, K> {
    pipeline: Mutex<RefCell<Option<Pipeline<'a, G, K>>>>,
}

impl<G, K> Shared<'_, G, K> {
    /// An empty cell.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pipeline: Mutex::new(RefCell::new(None)),
        }
    }

    /// Whether a driver has been configured into this cell.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        critical_section::with(|cs| self.pipeline.borrow_ref(cs).is_some())
    }
}

impl<'a, G, K> Shared<'a, G, K>
where
    G: SignalGenerator,
    K: Clock,
{
    /// Run `f` on the pipeline inside a critical section.
    ///
    /// Returns `None` when nothing has been configured yet.
    pub fn with<R>(&self, f: impl FnOnce(&mut Pipeline<'a, G, K>) -> R) -> Option<R> {
        critical_section::with(|cs| self.pipeline.borrow_ref_mut(cs).as_mut().map(f))
    }

    /// Completion interrupt entry point.
    pub fn on_transfer_complete(&self) {
        if self.with(Pipeline::on_transfer_complete).is_none() {
            warn!("completion event before configuration");
        }
    }

    /// Quiet-interval timer entry point.
    pub fn on_quiet_elapsed(&self) {
        self.with(Pipeline::on_quiet_elapsed);
    }

    /// Wire busy, quiet interval running, or a frame still queued.
    ///
    /// Also starts a queued frame whose quiet interval is over.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.with(|pipeline| {
            pipeline.poll();
            pipeline.is_busy()
        })
        .unwrap_or(false)
    }

    pub(crate) fn install(&self, pipeline: Pipeline<'a, G, K>) -> Result<(), ConfigurationError> {
        critical_section::with(|cs| {
            let mut slot = self.pipeline.borrow_ref_mut(cs);
            if slot.is_some() {
                return Err(ConfigurationError::AlreadyConfigured);
            }
            *slot = Some(pipeline);
            Ok(())
        })
    }
}

impl<G, K> Default for Shared<'_, G, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G, K> core::fmt::Debug for Shared<'_, G, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shared")
            .field("configured", &self.is_configured())
            .finish()
    }
}
