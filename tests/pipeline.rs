use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use embassy_time::{Duration, Instant};
use embedded_graphics::pixelcolor::RgbColor;
use multi_ws2811::{
    color_from_u32, transmit_words, Buffers, ChannelOrder, Chunk, Clock, Color, Config,
    DitherTable, Error, FrameEncoder, Mode, MultiWs2811, Shared, SignalGenerator, State, Timing,
};

/// Clock that moves forward by `step` µs on every read, so spin loops make
/// progress without real time passing.
#[derive(Clone)]
struct AutoClock {
    micros: Arc<AtomicU64>,
    step: u64,
}

impl AutoClock {
    fn new(step: u64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(0)),
            step,
        }
    }
}

impl Clock for AutoClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.micros.fetch_add(self.step, Ordering::SeqCst))
    }
}

/// Signal generator that captures everything it is asked to send.
#[derive(Default)]
struct Recorder {
    arms: Vec<(usize, usize)>,
    frames: Vec<Vec<u16>>,
    timers: Vec<Duration>,
    in_flight: bool,
    overlapped: bool,
}

impl SignalGenerator for Recorder {
    fn arm(&mut self, chunk: Chunk<'_>) {
        self.overlapped |= self.in_flight;
        self.in_flight = true;
        let positions = chunk.positions();
        self.arms.push((positions.start, positions.len()));
        if chunk.starts_frame() {
            self.frames.push(Vec::new());
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.extend_from_slice(chunk.words());
        }
    }

    fn schedule_quiet_timer(&mut self, delay: Duration) {
        self.timers.push(delay);
    }
}

type TestShared<'a> = Shared<'a, Recorder, AutoClock>;

/// Play the completion interrupt for the chunk in flight, if any.
fn finish_chunk(shared: &TestShared<'_>) -> bool {
    let armed = shared
        .with(|pipeline| {
            let armed = pipeline.scheduler().is_armed();
            if armed {
                pipeline.generator_mut().in_flight = false;
            }
            armed
        })
        .unwrap_or(false);
    if armed {
        shared.on_transfer_complete();
    }
    armed
}

fn finish_frame(shared: &TestShared<'_>) {
    while finish_chunk(shared) {}
}

fn is_armed(shared: &TestShared<'_>) -> bool {
    shared
        .with(|pipeline| pipeline.scheduler().is_armed())
        .unwrap_or(false)
}

/// Let `count` continuous-mode frames go by, checking that every refresh
/// starts only after the quiet interval.
fn run_frames(shared: &TestShared<'_>, count: usize) {
    for _ in 0..count {
        finish_frame(shared);
        while !is_armed(shared) {
            shared.on_quiet_elapsed();
        }
        let (state, last) = shared
            .with(|p| (p.scheduler().state(), p.scheduler().last_completion()))
            .unwrap();
        let (State::Armed(cursor), Some(last)) = (state, last) else {
            panic!("refresh not started after a finished frame: {state:?}");
        };
        assert_eq!(cursor.start, 0);
        assert!(
            cursor.armed_at - last >= Duration::from_micros(300),
            "refresh armed {:?} after the last frame",
            cursor.armed_at - last
        );
    }
}

fn recorded<R>(shared: &TestShared<'_>, f: impl FnOnce(&Recorder) -> R) -> R {
    shared.with(|pipeline| f(pipeline.generator())).unwrap()
}

#[test]
fn test_single_pixel_grb_frame() {
    let mut draw = vec![Color::BLACK; 40];
    let mut transmit = vec![0u16; transmit_words(10)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(10, 4),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    leds.set_pixel(2, 5, color_from_u32(0x00FF80)).unwrap();
    assert_eq!(leds.get_pixel_packed(2 * 10 + 5), Ok(0x00FF80));
    leds.show().unwrap();
    assert_eq!(leds.get_pixel(2, 5), Ok(Color::new(0x00, 0xFF, 0x80)));

    let frame = recorded(&shared, |recorder| recorder.frames[0].clone());
    assert_eq!(frame.len(), 10 * 192);
    // channel 2: line 0, bank 5; wire bytes G=0xFF R=0x00 B=0x80
    for bit in 0..24 {
        let word = frame[5 * 192 + bit * 8 + 5];
        assert_eq!(word & 1 != 0, bit < 8 || bit == 16, "bit {bit}");
    }
    let set_bits: u32 = frame.iter().map(|word| word.count_ones()).sum();
    assert_eq!(set_bits, 9);
}

#[test]
fn test_all_orders_round_trip_across_128_channels() {
    for order in ChannelOrder::ALL {
        let mut draw = vec![Color::BLACK; 3 * 128];
        let mut transmit = vec![0u16; transmit_words(3)];
        let shared = Shared::new();
        let mut leds = MultiWs2811::configure(
            &shared,
            Config::new(3, 128).with_order(order),
            Buffers::new(&mut draw, &mut transmit),
            Recorder::default(),
            AutoClock::new(1),
        )
        .unwrap();

        let color = |channel: usize, position: usize| {
            Color::new(
                channel as u8,
                (position * 85) as u8,
                (channel * 7 + position) as u8 ^ 0xA5,
            )
        };
        for channel in 0..128 {
            for position in 0..3 {
                leds.set_pixel(channel, position, color(channel, position))
                    .unwrap();
            }
        }
        leds.show().unwrap();

        let frame = recorded(&shared, |recorder| recorder.frames[0].clone());
        let decoder = FrameEncoder::new(leds.geometry(), order, DitherTable::identity());
        for channel in 0..128 {
            for position in 0..3 {
                assert_eq!(
                    decoder.decode_pixel(&frame, channel, position),
                    color(channel, position),
                    "{order:?} channel {channel} position {position}"
                );
            }
        }
    }
}

#[test]
fn test_long_strips_are_sent_in_chunks() {
    let mut draw = vec![Color::BLACK; 400];
    let mut transmit = vec![0u16; transmit_words(400)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(400, 1),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    leds.fill(Color::WHITE);
    leds.show().unwrap();
    assert_eq!(recorded(&shared, |r| r.arms.clone()), [(0, 170)]);

    finish_frame(&shared);
    recorded(&shared, |recorder| {
        assert_eq!(recorder.arms, [(0, 170), (170, 170), (340, 60)]);
        assert_eq!(recorder.frames.len(), 1);
        assert_eq!(recorder.frames[0].len(), 400 * 192);
        assert!(!recorder.overlapped);
    });
    assert_eq!(leds.frames_completed(), 1);
}

#[test]
fn test_custom_chunk_limit() {
    let mut draw = vec![Color::BLACK; 40];
    let mut transmit = vec![0u16; transmit_words(20)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(20, 2).with_max_chunk(7),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    leds.show().unwrap();
    finish_frame(&shared);
    assert_eq!(
        recorded(&shared, |r| r.arms.clone()),
        [(0, 7), (7, 7), (14, 6)]
    );
}

#[test]
fn test_back_to_back_shows_respect_quiet_interval() {
    let mut draw = vec![Color::BLACK; 800];
    let mut transmit = vec![0u16; transmit_words(400)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(400, 2),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    for frame in 0..5u8 {
        leds.fill(Color::new(frame, 0, 0));
        leds.show().unwrap();

        let (state, last) = shared
            .with(|p| (p.scheduler().state(), p.scheduler().last_completion()))
            .unwrap();
        let State::Armed(cursor) = state else {
            panic!("frame {frame} not started: {state:?}");
        };
        assert_eq!(cursor.start, 0);
        if let Some(last) = last {
            assert!(cursor.armed_at - last >= Duration::from_micros(300));
        }
        finish_frame(&shared);
    }

    recorded(&shared, |recorder| {
        assert_eq!(recorder.frames.len(), 5);
        assert_eq!(recorder.arms.len(), 15);
        assert!(!recorder.overlapped);
    });
}

#[test]
fn test_two_immediate_shows_send_two_frames() {
    let mut draw = vec![Color::BLACK; 8 * 400];
    let mut transmit = vec![0u16; transmit_words(400)];
    let shared = Shared::new();
    let timing = Timing {
        stall_margin: Duration::from_secs(3600),
        ..Timing::default()
    };
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(400, 8).with_timing(timing),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| loop {
            if !finish_chunk(&shared) {
                if done.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::yield_now();
            }
        });

        leds.fill(Color::RED);
        leds.show().unwrap();
        leds.fill(Color::BLUE);
        leds.show().unwrap();
        done.store(true, Ordering::SeqCst);
    });

    let decoder = FrameEncoder::new(leds.geometry(), leds.order(), DitherTable::identity());
    recorded(&shared, |recorder| {
        assert_eq!(recorder.frames.len(), 2);
        assert_eq!(recorder.arms.len(), 6);
        assert!(!recorder.overlapped);
        assert_eq!(decoder.decode_pixel(&recorder.frames[0], 7, 399), Color::RED);
        assert_eq!(decoder.decode_pixel(&recorder.frames[1], 7, 399), Color::BLUE);
    });
    assert_eq!(leds.frames_completed(), 2);
}

#[test]
fn test_continuous_mode_cycles_dither_phases() {
    let levels: Vec<[u8; 256]> = (0..4u8)
        .map(|phase| core::array::from_fn(|value| (value as u8).wrapping_add(phase)))
        .collect();
    let mut draw = vec![Color::BLACK; 36];
    let mut snapshot = vec![Color::BLACK; 36];
    let mut transmit = vec![0u16; transmit_words(12)];
    let shared = Shared::new();
    let config = Config::new(12, 3)
        .with_mode(Mode::ContinuousDither)
        .with_dither(DitherTable::new(&levels).unwrap());
    let mut leds = MultiWs2811::configure(
        &shared,
        config,
        Buffers::new(&mut draw, &mut transmit).with_snapshot(&mut snapshot),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    leds.set_pixel(1, 4, Color::new(10, 20, 30)).unwrap();
    leds.show().unwrap();
    assert_eq!(leds.dither_phase(), 0);

    run_frames(&shared, 8);
    assert_eq!(leds.frames_completed(), 8);
    assert_eq!(leds.dither_phase(), 0);

    // a new frame is picked up by the next refresh, without waiting
    leds.set_pixel(1, 4, Color::new(100, 100, 100)).unwrap();
    leds.show().unwrap();
    run_frames(&shared, 1);

    let decoder = FrameEncoder::new(leds.geometry(), leds.order(), DitherTable::identity());
    recorded(&shared, |recorder| {
        assert_eq!(recorder.frames.len(), 10);
        for (index, frame) in recorder.frames[..9].iter().enumerate() {
            let phase = (index % 4) as u8;
            assert_eq!(
                decoder.decode_pixel(frame, 1, 4),
                Color::new(10 + phase, 20 + phase, 30 + phase),
                "frame {index}"
            );
        }
        assert_eq!(
            decoder.decode_pixel(&recorder.frames[9], 1, 4),
            Color::new(101, 101, 101)
        );
        assert!(!recorder.timers.is_empty());
        assert!(recorder
            .timers
            .iter()
            .all(|&delay| delay <= Duration::from_micros(300)));
        assert!(!recorder.overlapped);
    });
}

#[test]
fn test_continuous_refresh_is_started_by_quiet_timer() {
    let mut draw = vec![Color::BLACK; 20];
    let mut snapshot = vec![Color::BLACK; 20];
    let mut transmit = vec![0u16; transmit_words(10)];
    let clock = AutoClock::new(1);
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(10, 2).with_mode(Mode::ContinuousDither),
        Buffers::new(&mut draw, &mut transmit).with_snapshot(&mut snapshot),
        Recorder::default(),
        clock.clone(),
    )
    .unwrap();

    leds.fill(Color::GREEN);
    leds.show().unwrap();

    let mut arms = Vec::new();
    for _ in 0..5 {
        let requested = recorded(&shared, |r| r.timers.len());
        finish_frame(&shared);
        // every refresh falls inside the quiet interval and asks for a timer
        assert_eq!(recorded(&shared, |r| r.timers.len()), requested + 1);
        clock.micros.fetch_add(10_000, Ordering::SeqCst);
        shared.on_quiet_elapsed();
        arms.push(recorded(&shared, |r| r.arms.len()));
    }
    assert_eq!(arms, [2, 3, 4, 5, 6]);
    assert_eq!(leds.frames_completed(), 5);
    assert!(leds.is_busy());
}

#[test]
fn test_direct_mode_always_uses_first_phase() {
    let levels: Vec<[u8; 256]> = (0..2u8)
        .map(|phase| core::array::from_fn(|value| (value as u8).wrapping_add(phase * 50)))
        .collect();
    let mut draw = vec![Color::BLACK; 4];
    let mut transmit = vec![0u16; transmit_words(4)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(4, 1).with_dither(DitherTable::new(&levels).unwrap()),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    leds.fill(Color::new(1, 2, 3));
    for _ in 0..3 {
        leds.show().unwrap();
        finish_frame(&shared);
        assert_eq!(leds.dither_phase(), 0);
    }

    let decoder = FrameEncoder::new(leds.geometry(), leds.order(), DitherTable::identity());
    recorded(&shared, |recorder| {
        assert_eq!(recorder.frames.len(), 3);
        for frame in &recorder.frames {
            assert_eq!(decoder.decode_pixel(frame, 0, 3), Color::new(1, 2, 3));
        }
    });
}

#[test]
fn test_stalled_generator_is_reported_and_recoverable() {
    let mut draw = vec![Color::BLACK; 10];
    let mut transmit = vec![0u16; transmit_words(10)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(10, 1),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    leds.show().unwrap();
    assert_eq!(leds.health(), Ok(()));

    // no completion ever arrives; 10 positions give a 1600 µs budget
    let error = leds.show().unwrap_err();
    assert!(
        matches!(
            error,
            Error::TransferStall {
                start: 0,
                len: 10,
                waited_us
            } if waited_us > 1600
        ),
        "{error:?}"
    );
    assert!(leds.health().is_err());
    assert!(leds.is_busy());

    assert!(matches!(leds.recover(), Ok(State::Armed(_))));
    assert_eq!(leds.health(), Ok(()));
    shared.with(|pipeline| pipeline.generator_mut().in_flight = false);

    leds.show().unwrap();
    finish_frame(&shared);
    recorded(&shared, |recorder| {
        assert_eq!(recorder.frames.len(), 2);
        assert!(!recorder.overlapped);
    });
}

#[test]
fn test_completion_before_configuration_is_ignored() {
    let shared: TestShared<'_> = Shared::new();
    shared.on_transfer_complete();
    shared.on_quiet_elapsed();
    assert!(!shared.is_busy());
    assert!(!shared.is_configured());
}

#[test]
fn test_out_of_range_pixels_are_rejected() {
    let mut draw = vec![Color::BLACK; 30];
    let mut transmit = vec![0u16; transmit_words(10)];
    let shared = Shared::new();
    let mut leds = MultiWs2811::configure(
        &shared,
        Config::new(10, 3),
        Buffers::new(&mut draw, &mut transmit),
        Recorder::default(),
        AutoClock::new(1),
    )
    .unwrap();

    assert_eq!(leds.pixel_count(), 30);
    assert_eq!(
        leds.set_pixel(3, 0, Color::RED),
        Err(Error::OutOfRange {
            channel: 3,
            position: 0
        })
    );
    assert_eq!(
        leds.set_pixel(0, 10, Color::RED),
        Err(Error::OutOfRange {
            channel: 0,
            position: 10
        })
    );
    assert!(leds.set_pixel_index(30, Color::RED).is_err());
    assert!(leds.set_pixel_index(29, Color::RED).is_ok());
    assert_eq!(leds.get_pixel(2, 9), Ok(Color::RED));
}
