use std::io::Write;
use std::time::Duration;

use pinpulse::{
    Bias, Config, Direction, EdgeKind, EdgeMode, GpioError, Line, LineConfig, LineValue,
    MockGpioBackend, TimingStrategy,
};

#[test]
fn output_line_drives_backend_level() {
    let backend = MockGpioBackend::new();
    let mut line = Line::new(&backend, 4, Direction::Output, Bias::None).expect("line");
    assert_eq!(line.pin(), 4);
    assert_eq!(line.direction(), Direction::Output);

    line.write(LineValue::from(true)).expect("write");
    assert_eq!(backend.level(4), Some(LineValue::Active));
    assert_eq!(line.read().expect("read"), LineValue::Active);
}

#[test]
fn requested_output_starts_at_initial_level() {
    let backend = MockGpioBackend::new();
    let mut config = LineConfig::new(Direction::Output, Bias::PullDown);
    config.initial = LineValue::Active;

    let line = Line::request(&backend, 10, config).expect("line");
    assert_eq!(line.bias(), Bias::PullDown);
    assert_eq!(line.edge(), None);
    assert_eq!(backend.level(10), Some(LineValue::Active));
    assert_eq!(backend.trace(10).len(), 1);
}

#[test]
fn input_line_rejects_writes_and_reads_driven_level() {
    let backend = MockGpioBackend::new();
    let mut line = Line::new(&backend, 5, Direction::Input, Bias::PullUp).expect("line");
    assert_eq!(line.bias(), Bias::PullUp);

    let err = line.write(LineValue::Active).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));

    backend.drive(5, LineValue::Active);
    assert!(line.read().expect("read").is_active());
}

#[test]
fn lines_are_claimed_exclusively_until_dropped() {
    let backend = MockGpioBackend::new();
    let line = Line::new(&backend, 6, Direction::Output, Bias::None).expect("line");
    assert!(backend.is_claimed(6));

    let err = Line::new(&backend, 6, Direction::Input, Bias::None).unwrap_err();
    assert!(matches!(err, GpioError::ResourceUnavailable(_)));

    drop(line);
    assert!(!backend.is_claimed(6));
    Line::new(&backend, 6, Direction::Input, Bias::None).expect("reclaim");
}

#[test]
fn edge_line_buffers_matching_events() {
    let backend = MockGpioBackend::new();
    let mut line = Line::for_edges(
        &backend,
        7,
        Bias::None,
        EdgeMode::Rising,
        Duration::ZERO,
        16,
    )
    .expect("edge line");
    assert!(line.event_fd().is_some());
    assert_eq!(line.edge(), Some(EdgeMode::Rising));

    backend.drive(7, LineValue::Active);
    backend.drive(7, LineValue::Inactive);
    backend.drive(7, LineValue::Active);

    let mut events = Vec::new();
    assert_eq!(line.read_edge_events(&mut events).expect("read"), 2);
    assert!(events.iter().all(|e| e.pin == 7 && e.kind == EdgeKind::Rising));
    assert!(events[0].timestamp_ns <= events[1].timestamp_ns);
}

#[test]
fn edge_reads_are_bounded_by_buffer_capacity() {
    let backend = MockGpioBackend::new();
    let mut line =
        Line::for_edges(&backend, 8, Bias::None, EdgeMode::Both, Duration::ZERO, 2).expect("line");
    for _ in 0..3 {
        backend.drive(8, LineValue::Active);
        backend.drive(8, LineValue::Inactive);
    }

    let mut events = Vec::new();
    assert_eq!(line.read_edge_events(&mut events).expect("first"), 2);
    assert_eq!(line.read_edge_events(&mut events).expect("second"), 2);
    assert_eq!(line.read_edge_events(&mut events).expect("third"), 2);
    assert_eq!(line.read_edge_events(&mut events).expect("drained"), 0);
    assert_eq!(events.len(), 6);
}

#[test]
fn plain_line_has_no_edge_events() {
    let backend = MockGpioBackend::new();
    let mut line = Line::new(&backend, 9, Direction::Input, Bias::None).expect("line");
    assert!(line.event_fd().is_none());
    let err = line.read_edge_events(&mut Vec::new()).unwrap_err();
    assert!(matches!(err, GpioError::InvalidArgument(_)));
}

#[test]
fn default_config_matches_documented_bounds() {
    let config = Config::default();
    assert_eq!(config.max_pin, 27);
    assert_eq!(config.pwm.default_frequency_hz, 490);
    assert_eq!(config.pwm.frequency_range(), (50.0, 10_000.0));
    assert_eq!(config.pwm.busy_wait_threshold(), Duration::from_micros(100));
    assert_eq!(config.pwm.timing, TimingStrategy::HybridSleep);
    assert_eq!(config.interrupts.poll_timeout(), Duration::from_millis(100));
    assert!(config.validate().is_ok());
}

#[test]
fn partial_config_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"{{
            "chip": "/dev/gpiochip4",
            "pwm": {{ "timing": "busy-wait", "max_frequency_hz": 2000 }},
            "interrupts": {{ "bias": "pull-up", "debounce_ms": 5 }}
        }}"#
    )
    .expect("write config");

    let config = Config::load_from_file(file.path()).expect("load");
    assert_eq!(config.chip, "/dev/gpiochip4");
    assert_eq!(config.pwm.timing, TimingStrategy::BusyWait);
    assert_eq!(config.pwm.max_frequency_hz, 2000);
    assert_eq!(config.pwm.min_frequency_hz, 50);
    assert_eq!(config.interrupts.bias, Bias::PullUp);
    assert_eq!(config.interrupts.debounce(), Duration::from_millis(5));
    assert_eq!(config.interrupts.event_buffer_capacity, 16);
}

#[test]
fn invalid_config_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "{{ not json").expect("write");
    assert!(matches!(
        Config::load_from_file(file.path()),
        Err(GpioError::Config(_))
    ));

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"{{ "pwm": {{ "min_frequency_hz": 600, "max_frequency_hz": 500 }} }}"#
    )
    .expect("write");
    assert!(matches!(
        Config::load_from_file(file.path()),
        Err(GpioError::Config(_))
    ));

    assert!(matches!(
        Config::load_from_file("/nonexistent/pinpulse.json"),
        Err(GpioError::Config(_))
    ));
}
