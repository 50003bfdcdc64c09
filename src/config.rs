use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::line::{Bias, EdgeKind};
use crate::timing::TimingStrategy;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeMode {
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    pub fn matches(self, kind: EdgeKind) -> bool {
        match self {
            EdgeMode::Rising => kind == EdgeKind::Rising,
            EdgeMode::Falling => kind == EdgeKind::Falling,
            EdgeMode::Both => true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PwmConfig {
    pub default_frequency_hz: u32,
    pub min_frequency_hz: u32,
    pub max_frequency_hz: u32,
    pub timing: TimingStrategy,
    pub busy_wait_threshold_us: u64,
    pub duty_epsilon_percent: f64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            default_frequency_hz: 490,
            min_frequency_hz: 50,
            max_frequency_hz: 10_000,
            timing: TimingStrategy::HybridSleep,
            busy_wait_threshold_us: 100,
            duty_epsilon_percent: 0.1,
        }
    }
}

impl PwmConfig {
    pub fn busy_wait_threshold(&self) -> Duration {
        Duration::from_micros(self.busy_wait_threshold_us)
    }

    pub fn frequency_range(&self) -> (f64, f64) {
        (self.min_frequency_hz as f64, self.max_frequency_hz as f64)
    }

    /// Rejects settings a pulse generator cannot run with.
    pub fn validate(&self) -> Result<(), GpioError> {
        if self.min_frequency_hz == 0 {
            return Err(GpioError::Config(
                "pwm.min_frequency_hz must be positive".into(),
            ));
        }
        if self.min_frequency_hz > self.max_frequency_hz {
            return Err(GpioError::Config(format!(
                "pwm frequency range is empty ({}-{} Hz)",
                self.min_frequency_hz, self.max_frequency_hz
            )));
        }
        if !(self.min_frequency_hz..=self.max_frequency_hz).contains(&self.default_frequency_hz) {
            return Err(GpioError::Config(format!(
                "pwm.default_frequency_hz {} outside {}-{} Hz",
                self.default_frequency_hz, self.min_frequency_hz, self.max_frequency_hz
            )));
        }
        if !(0.0..50.0).contains(&self.duty_epsilon_percent) {
            return Err(GpioError::Config(
                "pwm.duty_epsilon_percent must be in [0, 50)".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct InterruptConfig {
    pub poll_timeout_ms: u64,
    pub event_buffer_capacity: usize,
    pub debounce_ms: u64,
    pub bias: Bias,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            event_buffer_capacity: 16,
            debounce_ms: 0,
            bias: Bias::None,
        }
    }
}

impl InterruptConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub chip: String,
    pub consumer: String,
    pub max_pin: u32,
    pub pwm: PwmConfig,
    pub interrupts: InterruptConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip0".to_string(),
            consumer: env!("CARGO_PKG_NAME").to_string(),
            max_pin: 27,
            pwm: PwmConfig::default(),
            interrupts: InterruptConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        self.pwm.validate()?;
        if self.interrupts.poll_timeout_ms == 0 {
            return Err(GpioError::Config(
                "interrupts.poll_timeout_ms must be positive".into(),
            ));
        }
        if self.interrupts.event_buffer_capacity == 0 {
            return Err(GpioError::Config(
                "interrupts.event_buffer_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
