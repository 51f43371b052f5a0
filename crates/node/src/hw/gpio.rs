//! Status LED and wake button on plain GPIOs.

use std::sync::Arc;

use anyhow::{Context, Result};
use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use tokio::sync::Notify;

use crate::link::StatusLed;

pub struct GpioLed {
    pin: OutputPin,
}

impl GpioLed {
    pub fn open(pin: u8) -> Result<Self> {
        let pin = Gpio::new()?
            .get(pin)
            .with_context(|| format!("claiming LED GPIO {pin}"))?
            .into_output_low();
        Ok(Self { pin })
    }
}

impl StatusLed for GpioLed {
    fn set(&mut self, on: bool) {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

/// Button to ground with the internal pull-up; each falling edge notifies
/// `edge`.  The interrupt stays armed for as long as this value lives.
pub struct WakeButton {
    _pin: InputPin,
}

impl WakeButton {
    pub fn arm(pin: u8, edge: Arc<Notify>) -> Result<Self> {
        let mut input = Gpio::new()?
            .get(pin)
            .with_context(|| format!("claiming wake button GPIO {pin}"))?
            .into_input_pullup();
        input
            .set_async_interrupt(Trigger::FallingEdge, move |_| edge.notify_one())
            .context("attaching wake button interrupt")?;
        Ok(Self { _pin: input })
    }
}
