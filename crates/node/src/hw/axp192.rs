//! AXP192 power-management IC over I2C, with its IRQ line on a GPIO.

use anyhow::{bail, Context, Result};
use rppal::gpio::{Gpio, InputPin, Trigger};
use rppal::i2c::I2c;
use tracing::info;

use crate::power::{IrqStatus, Pmu, Rail, ShutdownRequest};

const ADDRESS: u16 = 0x34;

// ── Registers ───────────────────────────────────────────────────────────────

const REG_IC_TYPE: u8 = 0x03;
/// Output enables: DCDC1 [0], DCDC3 [1], LDO2 [2], LDO3 [3], DCDC2 [4].
const REG_POWER_OUTPUT: u8 = 0x12;
/// Bit 7 set cuts all outputs.
const REG_SHUTDOWN: u8 = 0x32;
const REG_IRQ_ENABLE_3: u8 = 0x42;
/// IRQ status 1-5; write-one-to-clear.
const REG_IRQ_STATUS: [u8; 5] = [0x44, 0x45, 0x46, 0x47, 0x4D];
const REG_IRQ_STATUS_3: u8 = 0x46;
const REG_BATTERY_VOLTAGE: u8 = 0x78;
const REG_ADC_ENABLE_1: u8 = 0x82;

const AXP192_IC_TYPE: u8 = 0x03;
const SHUTDOWN_BIT: u8 = 1 << 7;
const ADC_BATTERY_VOLTAGE_BIT: u8 = 1 << 7;
/// PEK (power key) causes in IRQ register 3.
const PEK_LONG_PRESS_BIT: u8 = 1 << 0;
const PEK_SHORT_PRESS_BIT: u8 = 1 << 1;
/// Battery voltage ADC resolution.
const BATTERY_MV_PER_LSB: f32 = 1.1;

/// Output-control bit feeding each rail on the T-Beam style wiring.
fn rail_bit(rail: Rail) -> u8 {
    match rail {
        Rail::Sensors => 1 << 0, // DCDC1, 3V3 header
        Rail::Radio => 1 << 2,   // LDO2, LoRa module
        Rail::Gnss => 1 << 3,    // LDO3, GPS
    }
}

fn battery_millivolts_from(hi: u8, lo: u8) -> f32 {
    let raw = (u16::from(hi) << 4) | u16::from(lo & 0x0F);
    f32::from(raw) * BATTERY_MV_PER_LSB
}

fn irq_from_status(status3: u8) -> IrqStatus {
    IrqStatus {
        short_press: status3 & PEK_SHORT_PRESS_BIT != 0,
        long_press: status3 & PEK_LONG_PRESS_BIT != 0,
    }
}

pub struct Axp192 {
    i2c: I2c,
    irq_pin: InputPin,
}

impl Axp192 {
    /// Open I2C bus 1 and claim `irq_pin` (active low, pulled up).
    pub fn open(irq_pin: u8) -> Result<Self> {
        let mut i2c = I2c::new().context("opening I2C bus")?;
        i2c.set_slave_address(ADDRESS)?;
        let irq_pin = Gpio::new()?
            .get(irq_pin)
            .with_context(|| format!("claiming PMU IRQ GPIO {irq_pin}"))?
            .into_input_pullup();
        Ok(Self { i2c, irq_pin })
    }

    fn read(&mut self, reg: u8) -> Result<u8> {
        self.i2c
            .smbus_read_byte(reg)
            .with_context(|| format!("AXP192 read {reg:#04x}"))
    }

    fn write(&mut self, reg: u8, value: u8) -> Result<()> {
        self.i2c
            .smbus_write_byte(reg, value)
            .with_context(|| format!("AXP192 write {reg:#04x}"))
    }

    fn update(&mut self, reg: u8, mask: u8, set: bool) -> Result<()> {
        let current = self.read(reg)?;
        let next = if set { current | mask } else { current & !mask };
        if next != current {
            self.write(reg, next)?;
        }
        Ok(())
    }
}

impl Pmu for Axp192 {
    fn detect(&mut self) -> Result<()> {
        let id = self.read(REG_IC_TYPE)?;
        if id != AXP192_IC_TYPE {
            bail!("unexpected PMU type {id:#04x} at {ADDRESS:#04x}");
        }
        info!(addr = format_args!("0x{ADDRESS:02x}"), "axp192 found");
        Ok(())
    }

    fn set_rail(&mut self, rail: Rail, on: bool) -> Result<()> {
        self.update(REG_POWER_OUTPUT, rail_bit(rail), on)
    }

    fn enable_battery_adc(&mut self) -> Result<()> {
        self.update(REG_ADC_ENABLE_1, ADC_BATTERY_VOLTAGE_BIT, true)
    }

    fn battery_millivolts(&mut self) -> Result<f32> {
        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_BATTERY_VOLTAGE, &mut buf)
            .context("AXP192 battery voltage")?;
        Ok(battery_millivolts_from(buf[0], buf[1]))
    }

    fn enable_button_irqs(&mut self) -> Result<()> {
        self.update(
            REG_IRQ_ENABLE_3,
            PEK_LONG_PRESS_BIT | PEK_SHORT_PRESS_BIT,
            true,
        )
    }

    fn read_irq(&mut self) -> Result<IrqStatus> {
        Ok(irq_from_status(self.read(REG_IRQ_STATUS_3)?))
    }

    fn clear_irq(&mut self) -> Result<()> {
        for reg in REG_IRQ_STATUS {
            self.write(reg, 0xFF)?;
        }
        Ok(())
    }

    fn attach_button_interrupt(&mut self, request: ShutdownRequest) -> Result<()> {
        self.irq_pin
            .set_async_interrupt(Trigger::FallingEdge, move |_| request.raise())
            .context("attaching PMU IRQ handler")
    }

    fn shutdown(&mut self) -> Result<()> {
        self.update(REG_SHUTDOWN, SHUTDOWN_BIT, true)
    }
}
