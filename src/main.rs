use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use pinpulse::{Board, Config, EdgeMode, GpioError, LineBackend};

#[cfg(feature = "hardware-gpio")]
use pinpulse::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use pinpulse::MockGpioBackend;

const USAGE: &str = "usage:
  pinpulse [config.json] pwm <pin> <value 0-255> [hz] [seconds]
  pinpulse [config.json] watch <pin> <rising|falling|both> [seconds]";

fn main() -> ExitCode {
    env_logger::init();

    match run(std::env::args().skip(1).collect()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}\n{USAGE}");
            ExitCode::FAILURE
        }
    }
}

fn run(mut args: Vec<String>) -> Result<(), GpioError> {
    let config_in_args = args.first().is_some_and(|a| a.ends_with(".json"));
    let config = if config_in_args {
        Config::load_from_file(args.remove(0))?
    } else {
        match std::env::var("PINPULSE_CONFIG") {
            Ok(path) => Config::load_from_file(path)?,
            Err(_) => Config::default(),
        }
    };
    let config = Arc::new(config);

    let backend: Arc<dyn LineBackend> = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(LibgpiodBackend::new(&config.chip, &config.consumer))
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::new())
        }
    };

    let board = Board::new(config.clone(), backend)?;

    let command = args.first().map(String::as_str);
    match command {
        Some("pwm") => {
            let pin = parse(&args, 1, "pin")?;
            let value = parse(&args, 2, "value")?;
            let hz = parse_or(&args, 3, "hz", config.pwm.default_frequency_hz)?;
            let seconds = parse_or(&args, 4, "seconds", 5u64)?;

            board.set_pwm(pin, value, hz)?;
            info!("pwm on pin {pin}: value {value} at {hz} Hz for {seconds}s");
            thread::sleep(Duration::from_secs(seconds));
            board.stop_pwm(pin);
            Ok(())
        }
        Some("watch") => {
            let pin = parse(&args, 1, "pin")?;
            let mode = match args.get(2).map(String::as_str) {
                Some("rising") => EdgeMode::Rising,
                Some("falling") => EdgeMode::Falling,
                Some("both") | None => EdgeMode::Both,
                Some(other) => {
                    return Err(GpioError::InvalidArgument(format!("unknown edge mode {other}")));
                }
            };
            let seconds = parse_or(&args, 3, "seconds", 10u64)?;

            let count = Arc::new(AtomicU64::new(0));
            let counter = Arc::clone(&count);
            board.attach_interrupt(
                pin,
                move || {
                    let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("edge #{n} on pin {pin}");
                },
                mode,
            )?;
            thread::sleep(Duration::from_secs(seconds));
            board.detach_interrupt(pin);
            info!("pin {pin}: {} edges", count.load(Ordering::Relaxed));
            Ok(())
        }
        _ => Err(GpioError::InvalidArgument("missing or unknown command".into())),
    }
}

fn parse<T: std::str::FromStr>(args: &[String], idx: usize, name: &str) -> Result<T, GpioError> {
    let raw = args
        .get(idx)
        .ok_or_else(|| GpioError::InvalidArgument(format!("missing {name}")))?;
    raw.parse()
        .map_err(|_| GpioError::InvalidArgument(format!("invalid {name}: {raw}")))
}

fn parse_or<T: std::str::FromStr>(
    args: &[String],
    idx: usize,
    name: &str,
    default: T,
) -> Result<T, GpioError> {
    match args.get(idx) {
        Some(_) => parse(args, idx, name),
        None => Ok(default),
    }
}
