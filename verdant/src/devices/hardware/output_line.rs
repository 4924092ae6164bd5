use crate::error::{ActuatorError, ConfigError};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use strum_macros::IntoStaticStr;
use uuid::Uuid;

/// Backend used to drive a line. `Simulated` lets the controller run on a
/// bench machine without GPIO hardware.
#[derive(Deserialize, Serialize, IntoStaticStr, Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineDriver {
    /// Raspberry Pi GPIO, only available with the `raspberry_pi` feature.
    Gpio,
    /// In memory line that records every write.
    Simulated,
}

/// Configuration for one digital output line such as the relay or the
/// alert buzzer. One config is used per physical line.
#[derive(Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct OutputLineConfig {
    /// Human readable name used in logs.
    pub label: String,
    /// BCM pin number.
    pub pin: u8,
    /// Relay boards are commonly wired so that a low pin energises the coil.
    #[serde(default)]
    pub active_low: bool,
    /// Drive the line with a 50% duty square wave while active, for
    /// passive buzzers.
    #[serde(default)]
    pub tone_hz: Option<f64>,
    pub driver: LineDriver,
}

impl OutputLineConfig {
    /// Create a new line config with an active high level and no tone.
    ///
    /// * `label`: name used in logs.
    /// * `pin`: BCM pin number.
    pub fn new(label: impl Into<String>, pin: u8, driver: LineDriver) -> Self {
        Self {
            label: label.into(),
            pin,
            active_low: false,
            tone_hz: None,
            driver,
        }
    }

    /// Create an `OutputLineConfig` by reading data from a file.
    ///
    /// * `filepath`: Path to file with configuration parameters.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, ConfigError> {
        let file = Path::new(&filepath);
        if !file.is_file() {
            return Err(ConfigError::NotFound(file.to_path_buf()));
        }
        let config_file = config::Config::builder()
            .add_source(config::File::new(
                &file.to_string_lossy(),
                config::FileFormat::Yaml,
            ))
            .build()?;
        Ok(config_file.try_deserialize::<Self>()?)
    }
}

/// Physical access to a single output pin. Implementations write raw
/// levels, polarity is handled by [`OutputDevice`].
pub trait OutputLine: Send {
    fn write(&mut self, high: bool) -> Result<(), ActuatorError>;

    /// Start a square wave. Lines that cannot generate one are held high.
    fn write_tone(&mut self, _frequency_hz: f64) -> Result<(), ActuatorError> {
        self.write(true)
    }
}

/// A device owns its driver and the config it was built from, and gets a
/// unique id for logging.
pub struct OutputDevice {
    uuid: Uuid,
    config: OutputLineConfig,
    driver: Box<dyn OutputLine>,
}

impl std::fmt::Debug for OutputDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDevice")
            .field("uuid", &self.uuid)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutputDevice {
    /// Open the line described by `config` and drive it inactive. Failing
    /// to acquire the line is returned so startup can abort.
    pub fn open(config: OutputLineConfig) -> Result<Self, ActuatorError> {
        let driver: Box<dyn OutputLine> = match config.driver {
            LineDriver::Simulated => Box::new(SimulatedLine::new().0),
            LineDriver::Gpio => open_gpio(&config)?,
        };
        Self::with_driver(config, driver)
    }

    /// Build a device around an already opened driver.
    pub fn with_driver(
        config: OutputLineConfig,
        driver: Box<dyn OutputLine>,
    ) -> Result<Self, ActuatorError> {
        let mut device = Self {
            uuid: Uuid::new_v4(),
            config,
            driver,
        };
        device.deactivate()?;
        Ok(device)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn activate(&mut self) -> Result<(), ActuatorError> {
        match self.config.tone_hz {
            Some(frequency_hz) => self.driver.write_tone(frequency_hz),
            None => self.driver.write(!self.config.active_low),
        }
    }

    pub fn deactivate(&mut self) -> Result<(), ActuatorError> {
        self.driver.write(self.config.active_low)
    }

    pub fn set_active(&mut self, active: bool) -> Result<(), ActuatorError> {
        if active {
            self.activate()
        } else {
            self.deactivate()
        }
    }
}

#[cfg(feature = "raspberry_pi")]
fn open_gpio(config: &OutputLineConfig) -> Result<Box<dyn OutputLine>, ActuatorError> {
    Ok(Box::new(gpio::GpioLine::open(config)?))
}

#[cfg(not(feature = "raspberry_pi"))]
fn open_gpio(config: &OutputLineConfig) -> Result<Box<dyn OutputLine>, ActuatorError> {
    let driver: &'static str = config.driver.into();
    Err(ActuatorError::DriverUnavailable(driver))
}

#[cfg(feature = "raspberry_pi")]
mod gpio {
    use super::{OutputLine, OutputLineConfig};
    use crate::error::ActuatorError;
    use rppal::gpio::{Gpio, OutputPin};

    /// Output pin on the Raspberry Pi header.
    pub struct GpioLine {
        label: String,
        pin: OutputPin,
        toning: bool,
    }

    impl GpioLine {
        pub fn open(config: &OutputLineConfig) -> Result<Self, ActuatorError> {
            let open_error = |e: rppal::gpio::Error| ActuatorError::Open {
                label: config.label.clone(),
                pin: config.pin,
                reason: e.to_string(),
            };
            let gpio = Gpio::new().map_err(open_error)?;
            let pin = gpio.get(config.pin).map_err(open_error)?;
            let pin = if config.active_low {
                pin.into_output_high()
            } else {
                pin.into_output_low()
            };
            Ok(Self {
                label: config.label.clone(),
                pin,
                toning: false,
            })
        }

        fn write_error(&self, e: rppal::gpio::Error) -> ActuatorError {
            ActuatorError::Write {
                label: self.label.clone(),
                reason: e.to_string(),
            }
        }
    }

    impl OutputLine for GpioLine {
        fn write(&mut self, high: bool) -> Result<(), ActuatorError> {
            if self.toning {
                self.pin.clear_pwm().map_err(|e| self.write_error(e))?;
                self.toning = false;
            }
            if high {
                self.pin.set_high();
            } else {
                self.pin.set_low();
            }
            Ok(())
        }

        fn write_tone(&mut self, frequency_hz: f64) -> Result<(), ActuatorError> {
            self.pin
                .set_pwm_frequency(frequency_hz, 0.5)
                .map_err(|e| self.write_error(e))?;
            self.toning = true;
            Ok(())
        }
    }
}

/// Write recorded by a [`SimulatedLine`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineEvent {
    Level(bool),
    Tone(f64),
}

/// In memory line. Every write is recorded and can be inspected through
/// the paired [`SimulatedProbe`].
pub struct SimulatedLine {
    history: Arc<Mutex<Vec<LineEvent>>>,
    failing: Arc<AtomicBool>,
}

/// Inspection handle for a [`SimulatedLine`].
#[derive(Clone)]
pub struct SimulatedProbe {
    history: Arc<Mutex<Vec<LineEvent>>>,
    failing: Arc<AtomicBool>,
}

impl SimulatedLine {
    pub fn new() -> (Self, SimulatedProbe) {
        let history = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(false));
        (
            Self {
                history: history.clone(),
                failing: failing.clone(),
            },
            SimulatedProbe { history, failing },
        )
    }

    fn record(&self, event: LineEvent) -> Result<(), ActuatorError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ActuatorError::Write {
                label: String::from("simulated"),
                reason: String::from("injected failure"),
            });
        }
        let mut history = self.history.lock().map_err(|e| ActuatorError::Write {
            label: String::from("simulated"),
            reason: e.to_string(),
        })?;
        history.push(event);
        Ok(())
    }
}

impl OutputLine for SimulatedLine {
    fn write(&mut self, high: bool) -> Result<(), ActuatorError> {
        self.record(LineEvent::Level(high))
    }

    fn write_tone(&mut self, frequency_hz: f64) -> Result<(), ActuatorError> {
        self.record(LineEvent::Tone(frequency_hz))
    }
}

impl SimulatedProbe {
    /// Every write so far, oldest first.
    pub fn events(&self) -> Vec<LineEvent> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<LineEvent> {
        self.events().last().copied()
    }

    /// Make subsequent writes fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}
