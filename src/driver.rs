//! Application-side driver handle.
//!
//! [`MultiWs2811`] owns the draw buffer and talks to the [`Shared`] pipeline
//! through short critical sections. Pixels are addressed either as
//! `(channel, position)` or by flat index `channel * strip_len + position`.
//!
//! # Example
//! ```rust,no_run
//! use embassy_time::Duration;
//! use embedded_graphics::pixelcolor::RgbColor;
//! use multi_ws2811::{
//!     transmit_words, Buffers, Chunk, Color, Config, MultiWs2811, Shared,
//!     SignalGenerator, SystemClock,
//! };
//!
//! struct Dma;
//!
//! impl SignalGenerator for Dma {
//!     fn arm(&mut self, chunk: Chunk<'_>) {
//!         // point the DMA channel at the chunk and start the timer
//!         let _words = chunk.words();
//!     }
//!
//!     fn schedule_quiet_timer(&mut self, delay: Duration) {
//!         // one-shot timer whose interrupt calls shared.on_quiet_elapsed()
//!         let _ticks = delay.as_ticks();
//!     }
//! }
//!
//! const STRIP_LEN: usize = 60;
//! const CHANNELS: usize = 32;
//!
//! let mut draw = [Color::BLACK; STRIP_LEN * CHANNELS];
//! let mut transmit = [0u16; transmit_words(STRIP_LEN)];
//! let shared = Shared::new();
//!
//! let mut leds = MultiWs2811::configure(
//!     &shared,
//!     Config::new(STRIP_LEN, CHANNELS),
//!     Buffers::new(&mut draw, &mut transmit),
//!     Dma,
//!     SystemClock,
//! )
//! .unwrap();
//!
//! leds.set_pixel(3, 10, Color::RED).unwrap();
//! leds.show().unwrap();
//! // the DMA completion interrupt calls shared.on_transfer_complete()
//! ```

use embedded_graphics::pixelcolor::RgbColor;
use embedded_graphics::prelude::{OriginDimensions, Size};
use embedded_graphics::Pixel;

use crate::addressing::{ChannelOrder, Geometry};
use crate::encoder::{DitherTable, FrameEncoder};
use crate::error::{BufferKind, ConfigurationError, Error};
use crate::pipeline::{Mode, Pipeline, Publish, Shared};
use crate::scheduler::{SignalGenerator, State, TransferScheduler, MAX_TRANSFER_POSITIONS};
use crate::settings::{Clock, Protocol, Settings, SystemClock, Timing};
use crate::{color_from_u32, color_to_u32, Color};

/// Driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config<'t> {
    /// LEDs per strip. Every strip has the same length.
    pub strip_len: usize,
    /// Number of strips, `1..=128`.
    pub channel_count: usize,
    /// Wire order of the color components.
    pub order: ChannelOrder,
    /// LED protocol variant.
    pub protocol: Protocol,
    /// Direct or continuous-dither operation.
    pub mode: Mode,
    /// Gamma/dither lookup table.
    pub dither: DitherTable<'t>,
    /// Largest chunk handed to the signal generator, in strip positions.
    pub max_chunk: usize,
    /// Protocol timing and stall budget.
    pub timing: Timing,
}

impl Config<'static> {
    /// Defaults for a geometry: GRB order, 800 kHz, direct mode, no dithering,
    /// 170-position chunks.
    #[must_use]
    pub const fn new(strip_len: usize, channel_count: usize) -> Self {
        Self {
            strip_len,
            channel_count,
            order: ChannelOrder::Grb,
            protocol: Protocol::Ws2811Fast,
            mode: Mode::Direct,
            dither: DitherTable::identity(),
            max_chunk: MAX_TRANSFER_POSITIONS,
            timing: Timing::for_protocol(Protocol::Ws2811Fast),
        }
    }

    /// Defaults for a geometry with order and protocol taken from a packed
    /// [`Settings`] byte.
    ///
    /// # Errors
    /// The settings byte names an unknown order or protocol.
    pub fn from_settings(
        strip_len: usize,
        channel_count: usize,
        settings: Settings,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self::new(strip_len, channel_count)
            .with_order(settings.order()?)
            .with_protocol(settings.protocol()?))
    }
}

impl<'t> Config<'t> {
    /// Set the channel order.
    #[must_use]
    pub const fn with_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the protocol; also resets the bit period.
    #[must_use]
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self.timing.bit_period_ns = protocol.bit_period_ns();
        self
    }

    /// Set the operating mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Use a gamma/dither lookup table.
    #[must_use]
    pub const fn with_dither<'u>(self, dither: DitherTable<'u>) -> Config<'u> {
        Config {
            strip_len: self.strip_len,
            channel_count: self.channel_count,
            order: self.order,
            protocol: self.protocol,
            mode: self.mode,
            dither,
            max_chunk: self.max_chunk,
            timing: self.timing,
        }
    }

    /// Limit the chunk size for a different DMA engine.
    #[must_use]
    pub const fn with_max_chunk(mut self, positions: usize) -> Self {
        self.max_chunk = positions;
        self
    }

    /// Override the timing parameters.
    #[must_use]
    pub const fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }
}

/// Caller-provided storage.
///
/// Each buffer must hold at least what the geometry needs; only that prefix is
/// used.
#[derive(Debug)]
pub struct Buffers<'a> {
    /// Application draw buffer, `pixel_count` colors.
    pub draw: &'a mut [Color],
    /// Copy snapshot, `pixel_count` colors. Required in continuous mode.
    pub snapshot: Option<&'a mut [Color]>,
    /// Bit-plane transmit buffer, `transmit_words(strip_len)` words.
    pub transmit: &'a mut [u16],
}

impl<'a> Buffers<'a> {
    /// Draw and transmit buffers without a snapshot.
    #[must_use]
    pub fn new(draw: &'a mut [Color], transmit: &'a mut [u16]) -> Self {
        Self {
            draw,
            snapshot: None,
            transmit,
        }
    }

    /// Add a copy snapshot.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: &'a mut [Color]) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Driver for up to 128 multiplexed LED strips.
pub struct MultiWs2811<'a, G, K = SystemClock> {
    geometry: Geometry,
    order: ChannelOrder,
    mode: Mode,
    draw: &'a mut [Color],
    shared: &'a Shared<'a, G, K>,
}

impl<'a, G, K> MultiWs2811<'a, G, K>
where
    G: SignalGenerator,
    K: Clock,
{
    /// Validate `config` against `buffers`, clear the buffers and install the
    /// pipeline into `shared`.
    ///
    /// # Errors
    /// [`Error::Configuration`] for an invalid geometry, a buffer that is too
    /// small, continuous mode without a snapshot, or an already configured
    /// `shared`. No buffer is modified in that case.
    pub fn configure(
        shared: &'a Shared<'a, G, K>,
        config: Config<'a>,
        buffers: Buffers<'a>,
        generator: G,
        clock: K,
    ) -> Result<Self, Error> {
        if shared.is_configured() {
            return Err(ConfigurationError::AlreadyConfigured.into());
        }
        let geometry = Geometry::new(config.strip_len, config.channel_count)?;
        let scheduler = TransferScheduler::new(config.strip_len, config.max_chunk, config.timing)?;
        let pixels = geometry.pixel_count();
        let words = geometry.transmit_words();

        check_len(BufferKind::Draw, pixels, buffers.draw.len())?;
        match &buffers.snapshot {
            Some(snapshot) => check_len(BufferKind::Snapshot, pixels, snapshot.len())?,
            None if config.mode == Mode::ContinuousDither => {
                return Err(ConfigurationError::MissingSnapshot.into());
            }
            None => {}
        }
        check_len(BufferKind::Transmit, words, buffers.transmit.len())?;

        let Buffers {
            draw,
            snapshot,
            transmit,
        } = buffers;
        let (draw, _) = draw.split_at_mut(pixels);
        let (transmit, _) = transmit.split_at_mut(words);
        let snapshot = snapshot.map(|snapshot| {
            let (snapshot, _) = snapshot.split_at_mut(pixels);
            snapshot.fill(Color::BLACK);
            snapshot
        });
        draw.fill(Color::BLACK);
        transmit.fill(0);

        let encoder = FrameEncoder::new(geometry, config.order, config.dither);
        shared.install(Pipeline::new(
            encoder,
            scheduler,
            config.mode,
            transmit,
            snapshot,
            generator,
            clock,
        ))?;

        info!(
            "configured {} strips of {} LEDs, {} chunk positions",
            geometry.channel_count(),
            geometry.strip_len(),
            config.max_chunk
        );

        Ok(Self {
            geometry,
            order: config.order,
            mode: config.mode,
            draw,
            shared,
        })
    }

    /// Publish the draw buffer.
    ///
    /// In [`Mode::Direct`] this blocks until the previous frame is off the
    /// wire, encodes the current pixels and waits for the new frame to start.
    /// In [`Mode::ContinuousDither`] it only copies the pixels into the
    /// snapshot, waiting first if the previously published snapshot has not
    /// started yet. When no chunk is in flight it also encodes the snapshot.
    ///
    /// Encoding runs with interrupts enabled; only taking and returning the
    /// buffers happens inside a critical section.
    ///
    /// # Errors
    /// [`Error::TransferStall`] if the signal generator stops reporting
    /// completions while waiting.
    pub fn show(&mut self) -> Result<(), Error> {
        let draw: &[Color] = &*self.draw;
        let result = match self.mode {
            Mode::Direct => self
                .publish(Pipeline::try_publish_direct)
                .and_then(|()| self.wait(Pipeline::try_settle)),
            Mode::ContinuousDither => {
                self.publish(|pipeline| pipeline.try_publish_continuous(draw))
            }
        };
        if let Err(Error::TransferStall {
            start,
            len,
            waited_us,
        }) = result
        {
            warn!("chunk {}+{} stalled after {} us", start, len, waited_us);
        }
        result
    }

    /// Wire busy, quiet interval running, or a published frame not started.
    ///
    /// Also starts a queued frame whose quiet interval is over.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Report a stalled transfer.
    ///
    /// # Errors
    /// [`Error::TransferStall`] while the armed chunk is past its budget.
    pub fn health(&self) -> Result<(), Error> {
        self.shared
            .with(|pipeline| pipeline.check_stall())
            .ok_or(ConfigurationError::NotConfigured)?
    }

    /// Abandon the in-flight or queued transfer after a stall.
    ///
    /// The caller is responsible for stopping the hardware first. Returns the
    /// scheduler state that was dropped.
    pub fn recover(&mut self) -> Result<State, Error> {
        Ok(self
            .shared
            .with(Pipeline::abort)
            .ok_or(ConfigurationError::NotConfigured)?)
    }

    /// Dither phase of the frame in the transmit buffer.
    #[must_use]
    pub fn dither_phase(&self) -> usize {
        self.shared
            .with(|pipeline| pipeline.dither_phase())
            .unwrap_or(0)
    }

    /// Frames that finished on the wire since configuration.
    #[must_use]
    pub fn frames_completed(&self) -> u32 {
        self.shared
            .with(|pipeline| pipeline.frames_completed())
            .unwrap_or(0)
    }

    fn publish(
        &self,
        mut step: impl FnMut(&mut Pipeline<'a, G, K>) -> Result<Publish<'a>, Error>,
    ) -> Result<(), Error> {
        loop {
            match self
                .shared
                .with(&mut step)
                .ok_or(ConfigurationError::NotConfigured)??
            {
                Publish::Wait => core::hint::spin_loop(),
                Publish::Queued => return Ok(()),
                Publish::Encode(mut lease) => {
                    lease.encode(&*self.draw);
                    self.shared
                        .with(|pipeline| pipeline.restore(lease))
                        .ok_or(ConfigurationError::NotConfigured)?;
                    return Ok(());
                }
            }
        }
    }

    fn wait(
        &self,
        mut step: impl FnMut(&mut Pipeline<'a, G, K>) -> Result<bool, Error>,
    ) -> Result<(), Error> {
        loop {
            let done = self
                .shared
                .with(&mut step)
                .ok_or(ConfigurationError::NotConfigured)??;
            if done {
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }
}

impl<G, K> MultiWs2811<'_, G, K> {
    /// Set a pixel.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] outside the configured geometry.
    pub fn set_pixel(&mut self, channel: usize, position: usize, color: Color) -> Result<(), Error> {
        let index = self.geometry.pixel_index(channel, position)?;
        self.draw[index] = color;
        Ok(())
    }

    /// Read back a pixel from the draw buffer.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] outside the configured geometry.
    pub fn get_pixel(&self, channel: usize, position: usize) -> Result<Color, Error> {
        let index = self.geometry.pixel_index(channel, position)?;
        Ok(self.draw[index])
    }

    /// Set a pixel by flat index.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] for `index >= pixel_count()`.
    pub fn set_pixel_index(&mut self, index: usize, color: Color) -> Result<(), Error> {
        self.geometry.split_index(index)?;
        self.draw[index] = color;
        Ok(())
    }

    /// Read a pixel by flat index.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] for `index >= pixel_count()`.
    pub fn get_pixel_index(&self, index: usize) -> Result<Color, Error> {
        self.geometry.split_index(index)?;
        Ok(self.draw[index])
    }

    /// Set a pixel from a packed `0xRRGGBB` value.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] for `index >= pixel_count()`.
    pub fn set_pixel_packed(&mut self, index: usize, rgb: u32) -> Result<(), Error> {
        self.set_pixel_index(index, color_from_u32(rgb))
    }

    /// Read a pixel as a packed `0xRRGGBB` value.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] for `index >= pixel_count()`.
    pub fn get_pixel_packed(&self, index: usize) -> Result<u32, Error> {
        self.get_pixel_index(index).map(color_to_u32)
    }

    /// Set every pixel to `color`.
    pub fn fill(&mut self, color: Color) {
        self.draw.fill(color);
    }

    /// Set every pixel to black.
    pub fn clear(&mut self) {
        self.fill(Color::BLACK);
    }

    /// The draw buffer, channel-major.
    #[must_use]
    pub fn pixels(&self) -> &[Color] {
        &*self.draw
    }

    /// Mutable access to the draw buffer, channel-major.
    pub fn pixels_mut(&mut self) -> &mut [Color] {
        &mut *self.draw
    }

    /// Configured geometry.
    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(&self) -> usize {
        self.geometry.pixel_count()
    }

    /// LEDs per strip.
    #[must_use]
    pub const fn strip_len(&self) -> usize {
        self.geometry.strip_len()
    }

    /// Number of strips.
    #[must_use]
    pub const fn channel_count(&self) -> usize {
        self.geometry.channel_count()
    }

    /// Wire order of the color components.
    #[must_use]
    pub const fn order(&self) -> ChannelOrder {
        self.order
    }

    /// Operating mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }
}

fn check_len(buffer: BufferKind, required: usize, actual: usize) -> Result<(), ConfigurationError> {
    if actual < required {
        return Err(ConfigurationError::BufferTooSmall {
            buffer,
            required,
            actual,
        });
    }
    Ok(())
}

impl<G, K> OriginDimensions for MultiWs2811<'_, G, K> {
    fn size(&self) -> Size {
        Size::new(
            self.geometry.strip_len() as u32,
            self.geometry.channel_count() as u32,
        )
    }
}

impl<G, K> embedded_graphics::draw_target::DrawTarget for MultiWs2811<'_, G, K> {
    type Color = Color;

    type Error = Error;

    /// Draw pixels with `x` as the position along the strip and `y` as the
    /// channel.
    ///
    /// Pixels outside the strips are skipped; the first of them is returned as
    /// [`Error::OutOfRange`] once the rest are drawn.
    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let mut outside = None;
        for Pixel(point, color) in pixels {
            let channel = usize::try_from(point.y).unwrap_or(usize::MAX);
            let position = usize::try_from(point.x).unwrap_or(usize::MAX);
            if let Err(error) = self.set_pixel(channel, position, color) {
                outside.get_or_insert(error);
            }
        }
        outside.map_or(Ok(()), Err)
    }

    fn clear(&mut self, color: Self::Color) -> Result<(), Self::Error> {
        self.fill(color);
        Ok(())
    }
}

impl<G, K> core::fmt::Debug for MultiWs2811<'_, G, K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MultiWs2811")
            .field("geometry", &self.geometry)
            .field("order", &self.order)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "defmt")]
impl<G, K> defmt::Format for MultiWs2811<'_, G, K> {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "MultiWs2811 {{ geometry: {}, order: {}, mode: {} }}",
            self.geometry,
            self.order,
            self.mode
        );
    }
}
