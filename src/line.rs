use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::EdgeMode;
use crate::error::GpioError;

/// Logical level of a line, independent of its electrical polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineValue {
    Inactive,
    Active,
}

impl LineValue {
    pub fn is_active(self) -> bool {
        self == LineValue::Active
    }
}

impl From<bool> for LineValue {
    fn from(high: bool) -> Self {
        if high {
            LineValue::Active
        } else {
            LineValue::Inactive
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bias {
    #[default]
    None,
    PullUp,
    PullDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub pin: u32,
    pub kind: EdgeKind,
    pub timestamp_ns: u64,
}

/// Everything a backend needs to request a single line.
#[derive(Debug, Clone)]
pub struct LineConfig {
    pub direction: Direction,
    pub bias: Bias,
    pub edge: Option<EdgeMode>,
    pub debounce: Duration,
    pub initial: LineValue,
    pub event_buffer_capacity: usize,
}

impl LineConfig {
    pub fn new(direction: Direction, bias: Bias) -> Self {
        Self {
            direction,
            bias,
            edge: None,
            debounce: Duration::ZERO,
            initial: LineValue::Inactive,
            event_buffer_capacity: 0,
        }
    }

    pub fn edges(bias: Bias, edge: EdgeMode, debounce: Duration, capacity: usize) -> Self {
        Self {
            direction: Direction::Input,
            bias,
            edge: Some(edge),
            debounce,
            initial: LineValue::Inactive,
            event_buffer_capacity: capacity,
        }
    }
}

/// Source of line requests. Implemented by the character-device backend and
/// by the in-memory mock.
pub trait LineBackend: Send + Sync {
    fn request(&self, pin: u32, config: &LineConfig) -> Result<Box<dyn LineHandle>, GpioError>;
}

/// An acquired line request. Dropping the handle releases the line.
pub trait LineHandle: Send {
    fn set_value(&mut self, value: LineValue) -> Result<(), GpioError>;
    fn value(&mut self) -> Result<LineValue, GpioError>;
    /// Pollable descriptor signalling buffered edge events, if the line was
    /// requested with edge detection.
    fn event_fd(&self) -> Option<RawFd>;
    /// Appends every buffered edge event to `out`; returns how many were read.
    fn read_edge_events(&mut self, out: &mut Vec<EdgeEvent>) -> Result<usize, GpioError>;
}

/// Exclusive owner of one requested GPIO line.
pub struct Line {
    pin: u32,
    direction: Direction,
    bias: Bias,
    edge: Option<EdgeMode>,
    handle: Box<dyn LineHandle>,
}

impl Line {
    pub fn new(
        backend: &dyn LineBackend,
        pin: u32,
        direction: Direction,
        bias: Bias,
    ) -> Result<Self, GpioError> {
        Self::request(backend, pin, LineConfig::new(direction, bias))
    }

    /// Requests `pin` as an input reporting `edge` transitions.
    pub fn for_edges(
        backend: &dyn LineBackend,
        pin: u32,
        bias: Bias,
        edge: EdgeMode,
        debounce: Duration,
        event_buffer_capacity: usize,
    ) -> Result<Self, GpioError> {
        let config = LineConfig::edges(bias, edge, debounce, event_buffer_capacity);
        let line = Self::request(backend, pin, config)?;
        if line.handle.event_fd().is_none() {
            return Err(GpioError::ResourceUnavailable(format!(
                "edge detection unsupported on pin {pin}"
            )));
        }
        Ok(line)
    }

    pub fn request(
        backend: &dyn LineBackend,
        pin: u32,
        config: LineConfig,
    ) -> Result<Self, GpioError> {
        let handle = backend.request(pin, &config)?;
        Ok(Self {
            pin,
            direction: config.direction,
            bias: config.bias,
            edge: config.edge,
            handle,
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn bias(&self) -> Bias {
        self.bias
    }

    pub fn edge(&self) -> Option<EdgeMode> {
        self.edge
    }

    pub fn write(&mut self, value: LineValue) -> Result<(), GpioError> {
        if self.direction != Direction::Output {
            return Err(GpioError::InvalidArgument(format!(
                "pin {} must be in output mode to set value",
                self.pin
            )));
        }
        self.handle.set_value(value)
    }

    pub fn read(&mut self) -> Result<LineValue, GpioError> {
        self.handle.value()
    }

    pub fn event_fd(&self) -> Option<RawFd> {
        self.handle.event_fd()
    }

    pub fn read_edge_events(&mut self, out: &mut Vec<EdgeEvent>) -> Result<usize, GpioError> {
        if self.edge.is_none() {
            return Err(GpioError::InvalidArgument(format!(
                "pin {} was not requested for edge detection",
                self.pin
            )));
        }
        self.handle.read_edge_events(out)
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("pin", &self.pin)
            .field("direction", &self.direction)
            .field("bias", &self.bias)
            .field("edge", &self.edge)
            .finish_non_exhaustive()
    }
}
