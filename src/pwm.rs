use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::error::GpioError;
use crate::line::{Bias, Direction, Line, LineBackend, LineValue};
use crate::timing::{AtomicF64, Pacer};

/// Maps an 8-bit analog value onto a 0-100 % duty cycle.
pub fn duty_from_value(value: u8) -> f64 {
    f64::from(value) / 255.0 * 100.0
}

struct PulseState {
    frequency_hz: AtomicF64,
    duty_percent: AtomicF64,
    running: AtomicBool,
}

/// Software PWM on a single output line, driven by a dedicated worker thread.
///
/// Frequency and duty cycle are lock-free and picked up by the worker at the
/// start of its next period.
pub struct PulseGenerator {
    pin: u32,
    max_pin: u32,
    pacer: Pacer,
    frequency_range: (f64, f64),
    duty_epsilon: f64,
    state: Arc<PulseState>,
    worker: Option<JoinHandle<()>>,
}

impl PulseGenerator {
    /// Fails with `Config` if the PWM settings in `config` are unusable.
    pub fn new(pin: u32, config: &Config) -> Result<Self, GpioError> {
        let pwm = &config.pwm;
        pwm.validate()?;
        Ok(Self {
            pin,
            max_pin: config.max_pin,
            pacer: Pacer::new(pwm.timing, pwm.busy_wait_threshold()),
            frequency_range: pwm.frequency_range(),
            duty_epsilon: pwm.duty_epsilon_percent,
            state: Arc::new(PulseState {
                frequency_hz: AtomicF64::new(f64::from(pwm.default_frequency_hz)),
                duty_percent: AtomicF64::new(0.0),
                running: AtomicBool::new(false),
            }),
            worker: None,
        })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// Claims the line and starts pulsing it. On a running generator this
    /// only updates frequency and duty cycle.
    pub fn start(
        &mut self,
        backend: &dyn LineBackend,
        frequency_hz: f64,
        duty_percent: f64,
    ) -> Result<(), GpioError> {
        if self.pin > self.max_pin {
            return Err(GpioError::invalid_pin(self.pin, self.max_pin));
        }
        let (min, max) = self.frequency_range;
        if !(min..=max).contains(&frequency_hz) {
            return Err(GpioError::InvalidArgument(format!(
                "frequency {frequency_hz} Hz out of range (must be {min}-{max})"
            )));
        }
        if !(0.0..=100.0).contains(&duty_percent) {
            return Err(GpioError::InvalidArgument(format!(
                "duty cycle {duty_percent}% out of range (must be 0-100)"
            )));
        }

        if self.is_active() {
            self.state.frequency_hz.store(frequency_hz);
            self.state.duty_percent.store(duty_percent);
            debug!("pwm on pin {}: {frequency_hz} Hz, {duty_percent}%", self.pin);
            return Ok(());
        }

        // reap a worker that stopped itself after a write failure
        self.join_worker();

        let line = Line::new(backend, self.pin, Direction::Output, Bias::None)?;

        self.state.frequency_hz.store(frequency_hz);
        self.state.duty_percent.store(duty_percent);
        self.state.running.store(true, Ordering::Release);

        let pin = self.pin;
        let state = Arc::clone(&self.state);
        let pacer = self.pacer;
        let epsilon = self.duty_epsilon;
        let worker = thread::Builder::new()
            .name(format!("pwm-{pin}"))
            .spawn(move || run_pulses(pin, line, state, pacer, epsilon))
            .map_err(|e| {
                self.state.running.store(false, Ordering::Release);
                GpioError::Internal(format!("spawn pwm worker for pin {pin}: {e}"))
            })?;
        self.worker = Some(worker);

        info!(
            "started pwm on pin {pin}: {frequency_hz} Hz, {duty_percent}% ({:?})",
            self.pacer.strategy()
        );
        Ok(())
    }

    pub fn set_duty_cycle(&self, duty_percent: f64) {
        let duty = if duty_percent.is_nan() {
            0.0
        } else {
            duty_percent.clamp(0.0, 100.0)
        };
        self.state.duty_percent.store(duty);
    }

    pub fn set_frequency(&self, frequency_hz: f64) {
        let (min, max) = self.frequency_range;
        let frequency = if frequency_hz.is_nan() {
            min
        } else {
            frequency_hz.clamp(min, max)
        };
        self.state.frequency_hz.store(frequency);
    }

    pub fn duty_cycle(&self) -> f64 {
        self.state.duty_percent.load()
    }

    pub fn frequency(&self) -> f64 {
        self.state.frequency_hz.load()
    }

    pub fn is_active(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Stops the worker and waits until the line is low and released.
    pub fn stop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        if self.join_worker() {
            info!("stopped pwm on pin {}", self.pin);
        }
    }

    fn join_worker(&mut self) -> bool {
        match self.worker.take() {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("pwm worker for pin {} panicked", self.pin);
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for PulseGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pulses(pin: u32, mut line: Line, state: Arc<PulseState>, pacer: Pacer, epsilon: f64) {
    debug!("pwm worker started for pin {pin}");

    while state.running.load(Ordering::Acquire) {
        if let Err(e) = pulse_once(&mut line, &state, &pacer, epsilon) {
            error!("pwm on pin {pin} stopped: {e}");
            state.running.store(false, Ordering::Release);
            break;
        }
    }

    if let Err(e) = line.write(LineValue::Inactive) {
        warn!("failed to drive pin {pin} low on stop: {e}");
    }
    drop(line);

    debug!("pwm worker exited for pin {pin}");
}

fn pulse_once(
    line: &mut Line,
    state: &PulseState,
    pacer: &Pacer,
    epsilon: f64,
) -> Result<(), GpioError> {
    let frequency = state.frequency_hz.load();
    let duty = state.duty_percent.load();
    let period = Duration::from_secs_f64(1.0 / frequency);

    // pulses narrower than the scheduler can realise collapse to a level
    if duty <= epsilon {
        line.write(LineValue::Inactive)?;
        pacer.wait(period, &state.running);
        return Ok(());
    }
    if duty >= 100.0 - epsilon {
        line.write(LineValue::Active)?;
        pacer.wait(period, &state.running);
        return Ok(());
    }

    let on = period.mul_f64(duty / 100.0);
    let off = period.saturating_sub(on);

    line.write(LineValue::Active)?;
    pacer.wait(on, &state.running);
    line.write(LineValue::Inactive)?;
    pacer.wait(off, &state.running);
    Ok(())
}

/// Owns every software PWM channel, at most one per pin.
///
/// `set_pwm` and `stop` on one pin are serialized through a per-pin slot
/// lock; a caller that loses the race updates the winner's channel.
pub struct PulseRegistry {
    backend: Arc<dyn LineBackend>,
    config: Config,
    channels: Mutex<FxHashMap<u32, PulseGenerator>>,
    slots: Mutex<FxHashMap<u32, Arc<Mutex<()>>>>,
}

impl PulseRegistry {
    pub fn new(backend: Arc<dyn LineBackend>, config: &Config) -> Self {
        Self {
            backend,
            config: config.clone(),
            channels: Mutex::new(FxHashMap::default()),
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn default_frequency(&self) -> u32 {
        self.config.pwm.default_frequency_hz
    }

    /// Starts PWM on `pin` or updates the running channel in place.
    pub fn set_pwm(&self, pin: u32, value: u8, frequency_hz: u32) -> Result<(), GpioError> {
        let max_pin = self.config.max_pin;
        if pin > max_pin {
            return Err(GpioError::invalid_pin(pin, max_pin));
        }
        let (min, max) = (self.config.pwm.min_frequency_hz, self.config.pwm.max_frequency_hz);
        if !(min..=max).contains(&frequency_hz) {
            return Err(GpioError::InvalidArgument(format!(
                "frequency {frequency_hz} Hz out of range (must be {min}-{max})"
            )));
        }
        let duty = duty_from_value(value);
        let frequency = f64::from(frequency_hz);

        let slot = self.slot(pin);
        let _serialized = slot.lock();

        let stale = {
            let mut channels = self.channels.lock();
            if let Some(generator) = channels.get(&pin).filter(|g| g.is_active()) {
                generator.set_duty_cycle(duty);
                generator.set_frequency(frequency);
                debug!("updated pwm on pin {pin}: value {value}, {frequency_hz} Hz");
                return Ok(());
            }
            channels.remove(&pin)
        };
        if let Some(mut generator) = stale {
            warn!("replacing failed pwm channel on pin {pin}");
            generator.stop();
        }

        let mut generator = PulseGenerator::new(pin, &self.config)?;
        generator.start(self.backend.as_ref(), frequency, duty)?;

        let displaced = self.channels.lock().insert(pin, generator);
        if let Some(mut generator) = displaced {
            generator.stop();
        }
        Ok(())
    }

    /// Updates the duty cycle of a running channel; `false` if there is none.
    pub fn set_duty_cycle(&self, pin: u32, value: u8) -> bool {
        let channels = self.channels.lock();
        match channels.get(&pin) {
            Some(generator) if generator.is_active() => {
                generator.set_duty_cycle(duty_from_value(value));
                true
            }
            _ => false,
        }
    }

    /// Stops the channel on `pin`; `false` if none existed.
    pub fn stop(&self, pin: u32) -> bool {
        if pin > self.config.max_pin {
            return false;
        }
        let slot = self.slot(pin);
        let _serialized = slot.lock();
        let removed = self.channels.lock().remove(&pin);
        match removed {
            Some(mut generator) => {
                generator.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<PulseGenerator> = self.channels.lock().drain().map(|(_, g)| g).collect();
        for mut generator in drained {
            generator.stop();
        }
    }

    pub fn is_active(&self, pin: u32) -> bool {
        self.channels
            .lock()
            .get(&pin)
            .is_some_and(PulseGenerator::is_active)
    }

    pub fn active_count(&self) -> usize {
        self.channels
            .lock()
            .values()
            .filter(|g| g.is_active())
            .count()
    }

    pub fn duty_cycle(&self, pin: u32) -> Option<f64> {
        self.channels
            .lock()
            .get(&pin)
            .filter(|g| g.is_active())
            .map(PulseGenerator::duty_cycle)
    }

    pub fn frequency(&self, pin: u32) -> Option<f64> {
        self.channels
            .lock()
            .get(&pin)
            .filter(|g| g.is_active())
            .map(PulseGenerator::frequency)
    }

    fn slot(&self, pin: u32) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.lock().entry(pin).or_default())
    }
}

impl Drop for PulseRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
