//! ADS1115 16-bit ADC driver over I2C for the capacitive moisture probe.
//!
//! Reads one single-ended channel at PGA ±4.096 V, 128 SPS, single-shot
//! mode.  The raw count scale differs from a microcontroller's 10/12-bit
//! ADC, so `sampling.raw_dry` / `raw_wet` must be recalibrated for it.

use std::{thread, time::Duration};

use anyhow::{ensure, Context, Result};
use rppal::i2c::I2c;
use tracing::{debug, info};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS        write 1 to start single-shot conversion
//   [14:12] MUX       input multiplexer (channel selection)
//   [11:9]  PGA       programmable gain amplifier
//   [8]     MODE      0 = continuous, 1 = single-shot
//   [7:5]   DR        data rate
//   [4:2]   comparator mode / polarity / latch
//   [1:0]   COMP_QUE  11 = disable comparator (default)

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for AINx vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: u8 = 3;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register reads 1 once the conversion is done.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel)] << MUX_SHIFT)
}

pub struct Ads1115 {
    i2c: I2c,
    channel: u8,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the converter at `addr`.
    pub fn open(addr: u16, channel: u8) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
        );
        let mut i2c = I2c::new().context("opening I2C bus")?;
        i2c.set_slave_address(addr)?;

        info!(addr = format_args!("0x{addr:02x}"), channel, "ads1115 initialised");
        Ok(Self { i2c, channel })
    }

    /// Single-shot conversion, clamped to the single-ended range 0–32767.
    pub fn read_raw(&mut self) -> Result<f32> {
        let config = config_for_channel(self.channel);
        self.i2c
            .block_write(REG_CONFIG, &config.to_be_bytes())
            .context("starting ADS1115 conversion")?;

        thread::sleep(CONVERSION_WAIT);

        // One wait is normally enough at 128 SPS.
        for attempt in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            debug!(attempt, "ads1115 conversion not ready");
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_CONVERSION, &mut buf)
            .context("reading ADS1115 conversion")?;
        Ok(f32::from(i16::from_be_bytes(buf).max(0)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
