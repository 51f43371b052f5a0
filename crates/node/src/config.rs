//! TOML node configuration: loading and validation.
//!
//! Read once at boot.  Every section is optional and falls back to the
//! defaults below; only the network credentials have no usable default.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sampler::{DEFAULT_RAW_DRY, DEFAULT_RAW_WET, MAX_SAMPLES};
use crate::telemetry::{ATTRIBUTES_TOPIC, TELEMETRY_TOPIC};
use crate::update::UpdateSettings;

/// Config file used when `CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "node.toml";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device: DeviceSection,
    pub wifi: WifiSection,
    pub broker: BrokerSection,
    pub sampling: SamplingSection,
    pub sleep: SleepSection,
    pub update: UpdateSection,
    pub storage: StorageSection,
    pub sim: SimSection,
    pub hardware: HardwareSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Identifier published as `treeId`.
    pub tree_id: u32,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self { tree_id: 1 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WifiSection {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub access_token: String,
    /// PEM root certificate.  Absent means a plaintext session.
    pub ca_cert: Option<PathBuf>,
    pub telemetry_topic: String,
    pub attributes_topic: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            client_id: "soil_quality_sensor".into(),
            access_token: String::new(),
            ca_cert: None,
            telemetry_topic: TELEMETRY_TOPIC.into(),
            attributes_topic: ATTRIBUTES_TOPIC.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingSection {
    pub temperature_samples: usize,
    pub moisture_samples: usize,
    pub raw_dry: f32,
    pub raw_wet: f32,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            temperature_samples: 5,
            moisture_samples: 5,
            raw_dry: DEFAULT_RAW_DRY,
            raw_wet: DEFAULT_RAW_WET,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SleepSection {
    pub duration_s: u64,
}

impl Default for SleepSection {
    fn default() -> Self {
        Self { duration_s: 30 }
    }
}

impl SleepSection {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    pub hostname: String,
    pub password: String,
    pub bind: String,
    pub port: u16,
    pub staging_dir: PathBuf,
    pub max_image_bytes: u64,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            hostname: "soil-quality-sensor".into(),
            password: String::new(),
            bind: "0.0.0.0".into(),
            port: 3232,
            staging_dir: PathBuf::from("/var/lib/soil-node/update"),
            max_image_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Must be on tmpfs so the counter is lost on power-off.
    pub rtc_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            rtc_path: PathBuf::from("/run/soil-node/boot_epoch.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimSection {
    /// `drying`, `stable`, `flaky` or `wet`.
    pub scenario: String,
    pub association_ms: u64,
    /// Chance per link check that the simulated link drops.
    pub link_drop_prob: f64,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            scenario: "stable".into(),
            association_ms: 1500,
            link_drop_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareSection {
    /// GPIO wired to the PMU IRQ output.
    pub pmu_irq_pin: u8,
    pub led_pin: u8,
    pub wake_pin: u8,
    pub interface: String,
    /// 1-Wire id, e.g. `28-0316a2794bff`.  First probe found when unset.
    pub ds18b20_id: Option<String>,
    pub ads1115_address: u16,
    pub ads1115_channel: u8,
}

impl Default for HardwareSection {
    fn default() -> Self {
        Self {
            pmu_irq_pin: 4,
            led_pin: 17,
            wake_pin: 27,
            interface: "wlan0".into(),
            ds18b20_id: None,
            ads1115_address: 0x48,
            ads1115_channel: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins usable on the 40-pin header.  GPIO 0-1 are reserved for
/// the ID EEPROM and 2-3 carry the I2C bus the PMU and ADC sit on.
const VALID_GPIO_PINS: &[u8] = &[
    4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Validate every section, reporting all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_network(&mut errors);
        self.validate_sampling(&mut errors);
        self.validate_runtime(&mut errors);
        self.validate_hardware(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_network(&self, errors: &mut Vec<String>) {
        let w = &self.wifi;
        if w.ssid.trim().is_empty() {
            errors.push("wifi.ssid is empty".into());
        } else if w.ssid.len() > 32 {
            errors.push(format!("wifi.ssid is {} bytes, max 32", w.ssid.len()));
        }

        let b = &self.broker;
        if b.host.trim().is_empty() {
            errors.push("broker.host is empty".into());
        }
        if b.port == 0 {
            errors.push("broker.port must be non-zero".into());
        }
        if b.client_id.trim().is_empty() {
            errors.push("broker.client_id is empty".into());
        }
        if b.access_token.trim().is_empty() {
            errors.push("broker.access_token is empty".into());
        }
        if b.telemetry_topic.trim().is_empty() {
            errors.push("broker.telemetry_topic is empty".into());
        }

        let u = &self.update;
        if u.password.is_empty() {
            errors.push("update.password is empty".into());
        }
        if u.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("update.bind '{}' is not an IP address", u.bind));
        }
        if u.max_image_bytes == 0 {
            errors.push("update.max_image_bytes must be positive".into());
        }
    }

    fn validate_sampling(&self, errors: &mut Vec<String>) {
        let s = &self.sampling;
        for (name, n) in [
            ("temperature_samples", s.temperature_samples),
            ("moisture_samples", s.moisture_samples),
        ] {
            if n > MAX_SAMPLES {
                errors.push(format!("sampling.{name} {n} exceeds max {MAX_SAMPLES}"));
            }
        }
        if s.raw_dry == s.raw_wet {
            errors.push(format!(
                "sampling.raw_dry and raw_wet must differ, both {}",
                s.raw_dry
            ));
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        if self.sleep.duration_s == 0 {
            errors.push("sleep.duration_s must be positive".into());
        }
        if self.storage.rtc_path.as_os_str().is_empty() {
            errors.push("storage.rtc_path is empty".into());
        }

        let sim = &self.sim;
        if !(0.0..=1.0).contains(&sim.link_drop_prob) {
            errors.push(format!(
                "sim.link_drop_prob {} out of range [0.0, 1.0]",
                sim.link_drop_prob
            ));
        }
        #[cfg(feature = "sim")]
        if crate::sim::Scenario::parse(&sim.scenario).is_none() {
            errors.push(format!("sim.scenario '{}' is unknown", sim.scenario));
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let h = &self.hardware;
        let mut seen_pins: HashSet<u8> = HashSet::new();
        for (name, pin) in [
            ("pmu_irq_pin", h.pmu_irq_pin),
            ("led_pin", h.led_pin),
            ("wake_pin", h.wake_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!("hardware.{name} {pin} is not a usable GPIO"));
            } else if !seen_pins.insert(pin) {
                errors.push(format!("hardware.{name} {pin} is already in use"));
            }
        }
        if h.ads1115_channel > 3 {
            errors.push(format!(
                "hardware.ads1115_channel {} out of range 0-3",
                h.ads1115_channel
            ));
        }
        if !(0x48..=0x4B).contains(&h.ads1115_address) {
            errors.push(format!(
                "hardware.ads1115_address {:#04x} out of range 0x48-0x4b",
                h.ads1115_address
            ));
        }
        if h.interface.trim().is_empty() {
            errors.push("hardware.interface is empty".into());
        }
    }

    /// Listener settings; only valid after [`validate`](Self::validate).
    pub fn update_settings(&self) -> Result<UpdateSettings> {
        let u = &self.update;
        let ip: IpAddr = u
            .bind
            .parse()
            .with_context(|| format!("update.bind '{}'", u.bind))?;
        Ok(UpdateSettings {
            hostname: u.hostname.clone(),
            password: u.password.clone(),
            bind: SocketAddr::new(ip, u.port),
            staging_dir: u.staging_dir.clone(),
            max_image_bytes: u.max_image_bytes,
        })
    }
}

/// Read, parse and validate the config file at `path`.
pub fn load(path: &str) -> Result<NodeConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: NodeConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
