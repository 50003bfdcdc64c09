use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use pinpulse::{
    Bias, Board, Config, Direction, GpioError, Line, LineValue, MockGpioBackend, PulseGenerator,
    TimingStrategy, duty_from_value,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sample_board() -> (Arc<MockGpioBackend>, Board) {
    init_logging();
    let backend = Arc::new(MockGpioBackend::new());
    let board = Board::new(Arc::new(Config::default()), backend.clone()).expect("board");
    (backend, board)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Fraction of `[start, end)` during which the traced level was active.
fn high_fraction(trace: &[(Instant, LineValue)], start: Instant, end: Instant) -> f64 {
    let mut level = trace
        .iter()
        .take_while(|(t, _)| *t <= start)
        .last()
        .map(|(_, v)| *v)
        .unwrap_or(LineValue::Inactive);
    let mut cursor = start;
    let mut high = Duration::ZERO;
    for (t, value) in trace.iter().filter(|(t, _)| *t > start && *t < end) {
        if level.is_active() {
            high += *t - cursor;
        }
        cursor = *t;
        level = *value;
    }
    if level.is_active() {
        high += end - cursor;
    }
    high.as_secs_f64() / (end - start).as_secs_f64()
}

#[test]
fn zero_value_holds_line_low() {
    let (backend, board) = sample_board();
    board.set_pwm(4, 0, 1000).expect("set pwm");
    assert!(board.pwm().is_active(4));

    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    thread::sleep(Duration::from_millis(50));
    let end = Instant::now();

    assert_eq!(backend.level(4), Some(LineValue::Inactive));
    assert_eq!(high_fraction(&backend.trace(4), start, end), 0.0);
}

#[test]
fn full_value_holds_line_high() {
    let (backend, board) = sample_board();
    board.set_pwm(5, 255, 1000).expect("set pwm");

    assert!(wait_until(Duration::from_millis(500), || {
        backend.level(5) == Some(LineValue::Active)
    }));
    let start = Instant::now();
    thread::sleep(Duration::from_millis(50));
    let end = Instant::now();

    assert_eq!(high_fraction(&backend.trace(5), start, end), 1.0);
}

#[test]
fn half_duty_converges_to_half_high_time() {
    let (backend, board) = sample_board();
    board.set_pwm(17, 128, 1000).expect("set pwm");

    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    thread::sleep(Duration::from_millis(1000));
    let end = Instant::now();

    let fraction = high_fraction(&backend.trace(17), start, end);
    assert!(
        (fraction - 128.0 / 255.0).abs() < 0.15,
        "measured high fraction {fraction}"
    );

    assert!(board.stop_pwm(17));
    assert!(!board.pwm().is_active(17));
    assert_eq!(backend.level(17), Some(LineValue::Inactive));
}

#[test]
fn busy_wait_strategy_tracks_duty_cycle() {
    init_logging();
    let mut config = Config::default();
    config.pwm.timing = TimingStrategy::BusyWait;
    let backend = Arc::new(MockGpioBackend::new());
    let board = Board::new(Arc::new(config), backend.clone()).expect("board");

    board.set_pwm(6, 64, 200).expect("set pwm");
    thread::sleep(Duration::from_millis(20));
    let start = Instant::now();
    thread::sleep(Duration::from_millis(500));
    let end = Instant::now();
    board.stop_pwm(6);

    let fraction = high_fraction(&backend.trace(6), start, end);
    assert!(
        (fraction - 64.0 / 255.0).abs() < 0.15,
        "measured high fraction {fraction}"
    );
}

#[test]
fn repeated_set_pwm_updates_in_place() {
    let (_backend, board) = sample_board();
    board.set_pwm(12, 50, 500).expect("first");
    board.set_pwm(12, 200, 1000).expect("second");

    assert_eq!(board.pwm().active_count(), 1);
    let duty = board.pwm().duty_cycle(12).expect("duty");
    assert!((duty - 200.0 / 255.0 * 100.0).abs() < 1e-9);
    assert_eq!(board.pwm().frequency(12), Some(1000.0));
}

#[test]
fn set_duty_cycle_requires_running_channel() {
    let (_backend, board) = sample_board();
    assert!(!board.pwm().set_duty_cycle(3, 10));

    board.analog_write(3, 10).expect("analog write");
    assert_eq!(board.pwm().frequency(3), Some(490.0));
    assert!(board.pwm().set_duty_cycle(3, 255));
    assert_eq!(board.pwm().duty_cycle(3), Some(100.0));
}

#[test]
fn stop_releases_line_low() {
    let (backend, board) = sample_board();
    board.set_pwm(9, 255, 100).expect("set pwm");
    assert!(wait_until(Duration::from_millis(500), || {
        backend.level(9) == Some(LineValue::Active)
    }));

    assert!(board.stop_pwm(9));
    assert!(!board.pwm().is_active(9));
    assert_eq!(backend.level(9), Some(LineValue::Inactive));
    assert!(!backend.is_claimed(9));
    assert!(!board.stop_pwm(9));
}

#[test]
fn rejects_out_of_range_arguments() {
    let (backend, board) = sample_board();

    let err = board.set_pwm(28, 100, 490).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));

    let err = board.set_pwm(2, 100, 20).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));
    let err = board.set_pwm(2, 100, 20_000).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));

    assert_eq!(board.pwm().active_count(), 0);
    assert!(!backend.is_claimed(2));
}

#[test]
fn unavailable_line_fails_synchronously() {
    let (backend, board) = sample_board();
    backend.deny(7);
    let err = board.set_pwm(7, 100, 490).unwrap_err();
    assert!(matches!(err, GpioError::ResourceUnavailable(_)));
    assert!(!board.pwm().is_active(7));

    let backend_ref: &MockGpioBackend = &backend;
    let _held = Line::new(backend_ref, 8, Direction::Output, Bias::None).expect("line");
    let err = board.set_pwm(8, 100, 490).unwrap_err();
    assert!(matches!(err, GpioError::ResourceUnavailable(_)));
    assert_eq!(board.pwm().active_count(), 0);
}

#[test]
fn write_failure_stops_only_that_channel() {
    let (backend, board) = sample_board();
    board.set_pwm(10, 128, 1000).expect("pin 10");
    board.set_pwm(11, 128, 1000).expect("pin 11");

    backend.fail_writes(10, true);
    assert!(wait_until(Duration::from_secs(1), || !board.pwm().is_active(10)));
    assert!(board.pwm().is_active(11));
    assert_eq!(board.pwm().active_count(), 1);

    backend.fail_writes(10, false);
    board.set_pwm(10, 128, 1000).expect("restart");
    assert!(board.pwm().is_active(10));
    assert_eq!(board.pwm().active_count(), 2);
}

#[test]
fn generator_setters_clamp_and_stop_is_idempotent() {
    init_logging();
    let backend = MockGpioBackend::new();
    let config = Config::default();
    let mut generator = PulseGenerator::new(13, &config).expect("generator");
    assert_eq!(generator.pin(), 13);
    assert!(!generator.is_active());

    let err = generator.start(&backend, 10.0, 50.0).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));
    let err = generator.start(&backend, 100.0, 150.0).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));
    assert!(!backend.is_claimed(13));

    generator.start(&backend, 100.0, 50.0).expect("start");
    assert!(generator.is_active());

    generator.set_duty_cycle(150.0);
    assert_eq!(generator.duty_cycle(), 100.0);
    generator.set_duty_cycle(-3.0);
    assert_eq!(generator.duty_cycle(), 0.0);
    generator.set_frequency(1e6);
    assert_eq!(generator.frequency(), 10_000.0);

    generator.start(&backend, 250.0, 25.0).expect("update");
    assert_eq!(generator.frequency(), 250.0);
    assert_eq!(generator.duty_cycle(), 25.0);

    generator.stop();
    generator.stop();
    assert!(!generator.is_active());
    assert!(!backend.is_claimed(13));
    assert_eq!(backend.level(13), Some(LineValue::Inactive));
}

#[test]
fn dropping_board_stops_all_channels() {
    let (backend, board) = sample_board();
    board.set_pwm(1, 255, 490).expect("pin 1");
    board.set_pwm(2, 128, 490).expect("pin 2");
    drop(board);

    for pin in [1, 2] {
        assert!(!backend.is_claimed(pin));
        assert_eq!(backend.level(pin), Some(LineValue::Inactive));
    }
}

#[test]
fn generator_rejects_pin_outside_board_range() {
    init_logging();
    let backend = MockGpioBackend::new();
    let config = Config::default();
    let mut generator = PulseGenerator::new(config.max_pin + 1, &config).expect("generator");

    let err = generator.start(&backend, 490.0, 50.0).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));
    assert!(!generator.is_active());
    assert!(!backend.is_claimed(config.max_pin + 1));
}

#[test]
fn generator_rejects_unusable_pwm_settings() {
    let mut inverted = Config::default();
    inverted.pwm.min_frequency_hz = 600;
    inverted.pwm.max_frequency_hz = 500;
    assert!(matches!(
        PulseGenerator::new(2, &inverted),
        Err(GpioError::Config(_))
    ));

    let mut zero_floor = Config::default();
    zero_floor.pwm.min_frequency_hz = 0;
    assert!(matches!(
        PulseGenerator::new(2, &zero_floor),
        Err(GpioError::Config(_))
    ));
}

#[test]
fn concurrent_set_pwm_on_fresh_pin_updates_in_place() {
    init_logging();
    for round in 0..50 {
        let backend = Arc::new(MockGpioBackend::new());
        let board = Board::new(Arc::new(Config::default()), backend.clone()).expect("board");
        assert_eq!(board.config().max_pin, 27);
        let start = Barrier::new(2);

        let results: Vec<Result<(), GpioError>> = thread::scope(|s| {
            let handles: Vec<_> = (0..2u8)
                .map(|i| {
                    let (board, start) = (&board, &start);
                    s.spawn(move || {
                        start.wait();
                        board.set_pwm(3, 100 + i, 1000)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("set_pwm thread"))
                .collect()
        });

        assert!(results.iter().all(Result::is_ok), "round {round}: {results:?}");
        assert_eq!(board.pwm().active_count(), 1);
        let duty = board.pwm().duty_cycle(3).expect("duty");
        assert!(
            [100u8, 101].iter().any(|v| (duty - duty_from_value(*v)).abs() < 1e-9),
            "round {round}: duty {duty}"
        );
    }
}
