use log::debug;
use std::sync::Arc;

use crate::config::{Config, EdgeMode};
use crate::error::GpioError;
use crate::interrupt::EdgeDispatcher;
use crate::line::LineBackend;
use crate::pwm::PulseRegistry;

/// Arduino-style entry point owning the PWM channels and the interrupt
/// dispatcher for one process.
pub struct Board {
    config: Arc<Config>,
    pwm: PulseRegistry,
    interrupts: EdgeDispatcher,
}

impl Board {
    pub fn new(config: Arc<Config>, backend: Arc<dyn LineBackend>) -> Result<Self, GpioError> {
        config.validate()?;
        let pwm = PulseRegistry::new(Arc::clone(&backend), &config);
        let interrupts = EdgeDispatcher::new(backend, &config)?;
        Ok(Self {
            config,
            pwm,
            interrupts,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pwm(&self) -> &PulseRegistry {
        &self.pwm
    }

    pub fn interrupts(&self) -> &EdgeDispatcher {
        &self.interrupts
    }

    /// Drives `pin` with an 8-bit duty cycle at `frequency_hz`.
    pub fn set_pwm(&self, pin: u32, value: u8, frequency_hz: u32) -> Result<(), GpioError> {
        self.pwm.set_pwm(pin, value, frequency_hz)
    }

    /// `set_pwm` at the configured default frequency.
    pub fn analog_write(&self, pin: u32, value: u8) -> Result<(), GpioError> {
        self.pwm.set_pwm(pin, value, self.pwm.default_frequency())
    }

    pub fn stop_pwm(&self, pin: u32) -> bool {
        self.pwm.stop(pin)
    }

    pub fn attach_interrupt<F>(&self, pin: u32, callback: F, mode: EdgeMode) -> Result<(), GpioError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.interrupts.attach(pin, move |_| callback(), mode)
    }

    pub fn detach_interrupt(&self, pin: u32) {
        if !self.interrupts.detach(pin) {
            debug!("no interrupt attached to pin {pin}");
        }
    }

    /// Stops every PWM channel and the interrupt monitor.
    pub fn shutdown(&self) {
        self.pwm.stop_all();
        self.interrupts.shutdown();
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        self.shutdown();
    }
}
