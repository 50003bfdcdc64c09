use std::collections::VecDeque;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use nix::fcntl::OFlag;
use nix::time::{ClockId, clock_gettime};
use nix::unistd::pipe2;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::EdgeMode;
use crate::error::GpioError;
use crate::line::{Direction, EdgeEvent, EdgeKind, LineBackend, LineConfig, LineHandle, LineValue};

const MOCK_TRACE_CAPACITY: usize = 1 << 16;

type PinTable = Arc<Mutex<FxHashMap<u32, MockPinState>>>;

/// In-memory line provider. Lines are claimed exclusively, output levels are
/// traced with monotonic timestamps and `drive` simulates external stimulus
/// on edge-detecting inputs.
#[derive(Default)]
pub struct MockGpioBackend {
    pins: PinTable,
}

struct MockPinState {
    level: LineValue,
    claimed: bool,
    denied: bool,
    fail_writes: bool,
    fail_edge_reads: bool,
    trace: VecDeque<(Instant, LineValue)>,
    sink: Option<EdgeSink>,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            level: LineValue::Inactive,
            claimed: false,
            denied: false,
            fail_writes: false,
            fail_edge_reads: false,
            trace: VecDeque::new(),
            sink: None,
        }
    }
}

impl MockPinState {
    fn record(&mut self, value: LineValue) {
        while self.trace.len() >= MOCK_TRACE_CAPACITY {
            self.trace.pop_front();
        }
        self.trace.push_back((Instant::now(), value));
    }
}

struct EdgeSink {
    pin: u32,
    mode: EdgeMode,
    debounce: Duration,
    last_event: Option<Instant>,
    queue: VecDeque<EdgeEvent>,
    notify: File,
}

impl EdgeSink {
    fn push(&mut self, event: EdgeEvent) {
        let now = Instant::now();
        let allow = self
            .last_event
            .map(|t| now.duration_since(t) >= self.debounce)
            .unwrap_or(true);
        if !allow {
            return;
        }
        self.last_event = Some(now);
        self.queue.push_back(event);
        if let Err(e) = self.notify.write_all(&[1]) {
            warn!("mock edge notify for pin {} failed: {e}", self.pin);
        }
    }
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an external signal on `pin`, queueing an edge event for a
    /// watching line when the transition matches its mode.
    pub fn drive(&self, pin: u32, value: LineValue) {
        let mut pins = self.pins.lock();
        let state = pins.entry(pin).or_default();
        let old = state.level;
        state.level = value;
        if old == value {
            return;
        }
        state.record(value);

        let kind = match value {
            LineValue::Active => EdgeKind::Rising,
            LineValue::Inactive => EdgeKind::Falling,
        };
        if let Some(sink) = state.sink.as_mut() {
            if sink.mode.matches(kind) {
                sink.push(EdgeEvent {
                    pin,
                    kind,
                    timestamp_ns: monotonic_nanos(),
                });
            }
        }
    }

    pub fn level(&self, pin: u32) -> Option<LineValue> {
        self.pins.lock().get(&pin).map(|s| s.level)
    }

    pub fn is_claimed(&self, pin: u32) -> bool {
        self.pins.lock().get(&pin).is_some_and(|s| s.claimed)
    }

    /// Level changes observed on `pin`, oldest first.
    pub fn trace(&self, pin: u32) -> Vec<(Instant, LineValue)> {
        self.pins
            .lock()
            .get(&pin)
            .map(|s| s.trace.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn clear_trace(&self, pin: u32) {
        if let Some(state) = self.pins.lock().get_mut(&pin) {
            state.trace.clear();
        }
    }

    /// Makes every later request for `pin` fail as if permission were denied.
    pub fn deny(&self, pin: u32) {
        self.pins.lock().entry(pin).or_default().denied = true;
    }

    /// Makes writes to `pin` fail until cleared.
    pub fn fail_writes(&self, pin: u32, fail: bool) {
        self.pins.lock().entry(pin).or_default().fail_writes = fail;
    }

    /// Makes edge-event reads on `pin` fail until cleared.
    pub fn fail_edge_reads(&self, pin: u32, fail: bool) {
        self.pins.lock().entry(pin).or_default().fail_edge_reads = fail;
    }
}

impl LineBackend for MockGpioBackend {
    fn request(&self, pin: u32, config: &LineConfig) -> Result<Box<dyn LineHandle>, GpioError> {
        let mut pins = self.pins.lock();
        let state = pins.entry(pin).or_default();

        if state.denied {
            return Err(GpioError::ResourceUnavailable(format!(
                "request line {pin}: permission denied"
            )));
        }
        if state.claimed {
            return Err(GpioError::ResourceUnavailable(format!(
                "request line {pin}: device or resource busy"
            )));
        }

        let events = match config.edge {
            Some(mode) => {
                let (reader, writer) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
                    .map_err(|e| GpioError::ResourceUnavailable(format!("edge pipe: {e}")))?;
                state.sink = Some(EdgeSink {
                    pin,
                    mode,
                    debounce: config.debounce,
                    last_event: None,
                    queue: VecDeque::new(),
                    notify: File::from(writer),
                });
                Some(File::from(reader))
            }
            None => None,
        };

        if config.direction == Direction::Output && state.level != config.initial {
            state.level = config.initial;
            state.record(config.initial);
        }
        state.claimed = true;

        Ok(Box::new(MockLine {
            pin,
            pins: Arc::clone(&self.pins),
            capacity: config.event_buffer_capacity.max(1),
            events,
        }))
    }
}

struct MockLine {
    pin: u32,
    pins: PinTable,
    capacity: usize,
    events: Option<File>,
}

impl LineHandle for MockLine {
    fn set_value(&mut self, value: LineValue) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        let state = pins
            .get_mut(&self.pin)
            .ok_or_else(|| GpioError::Internal(format!("mock line {} vanished", self.pin)))?;
        if state.fail_writes {
            return Err(GpioError::Internal(format!(
                "set value on line {}: input/output error",
                self.pin
            )));
        }
        if state.level != value {
            state.level = value;
            state.record(value);
        }
        Ok(())
    }

    fn value(&mut self) -> Result<LineValue, GpioError> {
        self.pins
            .lock()
            .get(&self.pin)
            .map(|s| s.level)
            .ok_or_else(|| GpioError::Internal(format!("mock line {} vanished", self.pin)))
    }

    fn event_fd(&self) -> Option<RawFd> {
        self.events.as_ref().map(|f| f.as_raw_fd())
    }

    fn read_edge_events(&mut self, out: &mut Vec<EdgeEvent>) -> Result<usize, GpioError> {
        let Some(reader) = self.events.as_mut() else {
            return Ok(0);
        };
        let mut pins = self.pins.lock();
        let Some(state) = pins.get_mut(&self.pin) else {
            return Ok(0);
        };
        if state.fail_edge_reads {
            return Err(GpioError::Internal(format!(
                "read edge events on line {}: input/output error",
                self.pin
            )));
        }
        let Some(sink) = state.sink.as_mut() else {
            return Ok(0);
        };

        let count = sink.queue.len().min(self.capacity);
        out.extend(sink.queue.drain(..count));

        // one notify byte per queued event keeps the pipe readable while
        // events remain
        let mut scratch = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            match reader.read(&mut scratch[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(GpioError::Internal(format!(
                        "read edge events on line {}: {e}",
                        self.pin
                    )));
                }
            }
        }
        Ok(count)
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        if let Some(state) = self.pins.lock().get_mut(&self.pin) {
            state.claimed = false;
            state.sink = None;
        }
    }
}

fn monotonic_nanos() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}
