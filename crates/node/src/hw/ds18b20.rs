//! DS18B20 soil thermometer through the kernel `w1-therm` driver.
//!
//! Reading `w1_slave` triggers a conversion (~750 ms at 12 bits) and
//! returns two lines: the scratchpad with a CRC verdict, then the value in
//! millidegrees.
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

const W1_DEVICES: &str = "/sys/bus/w1/devices";
/// DS18B20 family code.
const FAMILY_PREFIX: &str = "28-";

pub struct Ds18b20 {
    slave: PathBuf,
}

impl Ds18b20 {
    /// Use the probe with 1-Wire `id`, or the first DS18B20 on the bus.
    pub fn locate(id: Option<&str>) -> Result<Self> {
        Self::locate_in(Path::new(W1_DEVICES), id)
    }

    fn locate_in(devices: &Path, id: Option<&str>) -> Result<Self> {
        let id = match id {
            Some(id) => id.to_string(),
            None => first_probe(devices)?,
        };
        let slave = devices.join(&id).join("w1_slave");
        if !slave.exists() {
            bail!("DS18B20 {id} not present under {}", devices.display());
        }
        info!(%id, "ds18b20 found");
        Ok(Self { slave })
    }

    pub fn read_celsius(&self) -> Result<f32> {
        let text = fs::read_to_string(&self.slave)
            .with_context(|| format!("reading {}", self.slave.display()))?;
        parse_w1_slave(&text)
    }
}

fn first_probe(devices: &Path) -> Result<String> {
    let entries =
        fs::read_dir(devices).with_context(|| format!("listing {}", devices.display()))?;
    let mut ids: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(FAMILY_PREFIX))
        .collect();
    ids.sort();
    ids.into_iter()
        .next()
        .ok_or_else(|| anyhow!("no DS18B20 on the 1-Wire bus"))
}

fn parse_w1_slave(text: &str) -> Result<f32> {
    let mut lines = text.lines();
    let crc = lines.next().ok_or_else(|| anyhow!("empty w1_slave"))?;
    if !crc.trim_end().ends_with("YES") {
        bail!("DS18B20 CRC check failed");
    }
    let value = lines
        .next()
        .and_then(|l| l.split_once("t="))
        .map(|(_, t)| t.trim())
        .ok_or_else(|| anyhow!("w1_slave has no temperature"))?;
    let milli: i32 = value
        .parse()
        .with_context(|| format!("bad temperature {value:?}"))?;
    Ok(milli as f32 / 1000.0)
}
