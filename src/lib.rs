pub mod backend;
mod board;
mod config;
mod error;
mod interrupt;
mod line;
mod pwm;
mod timing;

pub use board::Board;
pub use config::{Config, EdgeMode, InterruptConfig, PwmConfig};
pub use error::GpioError;
pub use interrupt::{EdgeCallback, EdgeDispatcher};
pub use line::{
    Bias, Direction, EdgeEvent, EdgeKind, Line, LineBackend, LineConfig, LineHandle, LineValue,
};
pub use pwm::{PulseGenerator, PulseRegistry, duty_from_value};
pub use timing::{AtomicF64, Pacer, TimingStrategy};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::MockGpioBackend;
