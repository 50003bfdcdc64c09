use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;

use libgpiod::{chip::Chip, line, line::EventClock, request};

use crate::config::EdgeMode;
use crate::error::GpioError;
use crate::line::{Bias, Direction, EdgeEvent, EdgeKind, LineBackend, LineConfig, LineHandle, LineValue};

/// Line provider backed by the GPIO character device through libgpiod.
pub struct LibgpiodBackend {
    chip: String,
    consumer: String,
}

struct GpiodLine {
    offset: u32,
    request: request::Request,
    buffer: Option<request::Buffer>,
}

impl LibgpiodBackend {
    pub fn new(chip: impl Into<String>, consumer: impl Into<String>) -> Self {
        Self {
            chip: chip.into(),
            consumer: consumer.into(),
        }
    }

    fn open_chip(&self) -> Result<Chip, GpioError> {
        let p = PathBuf::from(&self.chip);
        Chip::open(&p)
            .map_err(|e| GpioError::ResourceUnavailable(format!("open chip {}: {e}", self.chip)))
    }

    fn make_line_settings(config: &LineConfig) -> Result<line::Settings, GpioError> {
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::Internal(format!("libgpiod settings: {e}")))?;

        match config.direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| GpioError::Internal(format!("set direction: {e}")))?;
                ls.set_output_value(to_gpiod_value(config.initial))
                    .map_err(|e| GpioError::Internal(format!("set output value: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| GpioError::Internal(format!("set direction: {e}")))?;
            }
        }

        let bias = match config.bias {
            Bias::None => None,
            Bias::PullUp => Some(line::Bias::PullUp),
            Bias::PullDown => Some(line::Bias::PullDown),
        };
        ls.set_bias(bias)
            .map_err(|e| GpioError::Internal(format!("set bias: {e}")))?;

        if let Some(mode) = config.edge {
            let edge = match mode {
                EdgeMode::Rising => line::Edge::Rising,
                EdgeMode::Falling => line::Edge::Falling,
                EdgeMode::Both => line::Edge::Both,
            };
            ls.set_edge_detection(Some(edge))
                .map_err(|e| GpioError::Internal(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| GpioError::Internal(format!("set event clock: {e}")))?;
            ls.set_debounce_period(config.debounce);
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, GpioError> {
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::Internal(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| GpioError::Internal(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }

    fn request_lines(
        &self,
        chip: &Chip,
        line_cfg: &line::Config,
        event_buffer_capacity: usize,
    ) -> Result<request::Request, GpioError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::Internal(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(&self.consumer)
            .map_err(|e| GpioError::Internal(format!("request consumer: {e}")))?;
        if event_buffer_capacity > 0 {
            req_cfg.set_event_buffer_size(event_buffer_capacity);
        }
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::ResourceUnavailable(format!("request lines: {e}")))
    }
}

impl LineBackend for LibgpiodBackend {
    fn request(&self, pin: u32, config: &LineConfig) -> Result<Box<dyn LineHandle>, GpioError> {
        let chip = self.open_chip()?;
        let line_settings = Self::make_line_settings(config)?;
        let line_cfg = Self::make_line_config(pin, line_settings)?;
        let request = self.request_lines(&chip, &line_cfg, config.event_buffer_capacity)?;

        let buffer = match config.edge {
            Some(_) => Some(
                request::Buffer::new(config.event_buffer_capacity.max(1))
                    .map_err(|e| GpioError::Internal(format!("event buffer: {e}")))?,
            ),
            None => None,
        };

        Ok(Box::new(GpiodLine {
            offset: pin,
            request,
            buffer,
        }))
    }
}

impl LineHandle for GpiodLine {
    fn set_value(&mut self, value: LineValue) -> Result<(), GpioError> {
        self.request
            .set_value(self.offset, to_gpiod_value(value))
            .map_err(|e| GpioError::Internal(format!("set value: {e}")))?;
        Ok(())
    }

    fn value(&mut self) -> Result<LineValue, GpioError> {
        let value = self
            .request
            .value(self.offset)
            .map_err(|e| GpioError::Internal(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => LineValue::Inactive,
            line::Value::Active => LineValue::Active,
        })
    }

    fn event_fd(&self) -> Option<RawFd> {
        self.buffer.as_ref().map(|_| self.request.as_raw_fd())
    }

    fn read_edge_events(&mut self, out: &mut Vec<EdgeEvent>) -> Result<usize, GpioError> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(0);
        };
        let events = self
            .request
            .read_edge_events(buffer)
            .map_err(|e| GpioError::Internal(format!("read edge events: {e}")))?;

        let before = out.len();
        for evt in events {
            let evt = match evt {
                Ok(e) => e,
                Err(_) => continue,
            };
            let kind = match evt.event_type() {
                Ok(line::EdgeKind::Rising) => EdgeKind::Rising,
                Ok(line::EdgeKind::Falling) => EdgeKind::Falling,
                Err(_) => continue,
            };
            out.push(EdgeEvent {
                pin: self.offset,
                kind,
                timestamp_ns: evt.timestamp().as_nanos() as u64,
            });
        }
        Ok(out.len() - before)
    }
}

fn to_gpiod_value(value: LineValue) -> line::Value {
    match value {
        LineValue::Inactive => line::Value::InActive,
        LineValue::Active => line::Value::Active,
    }
}
