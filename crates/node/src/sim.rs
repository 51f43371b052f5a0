//! Simulated board for running the node on a development machine.
//!
//! The soil model keeps state across deep sleep (it lives in [`SimWorld`],
//! created once per process) and produces realistic readings:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading ADC and thermal noise
//! - Occasional spikes, including the DS18B20's 85 °C power-on value
//!
//! Ctrl-C acts as a long press of the power button and SIGUSR1 as the wake
//! button.  Broker, update listener and epoch store are the real ones.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{info, trace, warn};

use crate::config::NodeConfig;
use crate::coordinator::{Board, BoardParts};
use crate::link::{Radio, StatusLed};
use crate::mqtt::MqttBroker;
use crate::power::{IrqStatus, Pmu, Rail, ShutdownRequest};
use crate::sampler::SoilProbe;
use crate::storage::FileEpochStore;
use crate::update::TcpUpdateListener;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| anyhow!("simulator state poisoned"))
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable with `sim.scenario`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry.  Moderate noise.
    Drying,
    /// Hovers near the centre.  Low noise, rare spikes.
    Stable,
    /// High noise and frequent spikes.  Exercises the median filter.
    Flaky,
    /// Starts near the wet end and dries very slowly.
    Wet,
}

impl Scenario {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "drying" => Some(Self::Drying),
            "stable" => Some(Self::Stable),
            "flaky" => Some(Self::Flaky),
            "wet" => Some(Self::Wet),
            _ => None,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Soil model
// ---------------------------------------------------------------------------

/// Reading a DS18B20 returns right after power-up, before a conversion.
const DS18B20_RESET_C: f64 = 85.0;

pub struct SoilSim {
    /// Current "true" moisture in raw ADC counts.  Evolves each read.
    moisture: f64,
    /// Current "true" soil temperature.
    temperature: f64,

    raw_dry: f64,
    raw_wet: f64,
    center: f64,

    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,

    spike_prob: f32,
    spike_sigma: f64,
}

impl SoilSim {
    /// `raw_dry` / `raw_wet` should match the sampling calibration so the
    /// percentages come out in range.
    pub fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        let range = raw_dry - raw_wet;
        let center = (raw_dry + raw_wet) / 2.0;

        // Fractions of the calibrated range.
        // start_frac: 0.0 = at raw_wet (wettest), 1.0 = at raw_dry (driest)
        let (drift, walk, mean_rev, noise, spike_prob, spike, start_frac) = match scenario {
            Scenario::Drying => (0.001, 0.010, 0.02, 0.006, 0.03_f32, 0.15, 0.5),
            Scenario::Stable => (0.000_2, 0.004, 0.05, 0.003, 0.005, 0.07, 0.5),
            Scenario::Flaky => (0.000_7, 0.018, 0.02, 0.015, 0.10, 0.20, 0.5),
            Scenario::Wet => (0.000_2, 0.006, 0.02, 0.004, 0.02, 0.10, 0.2),
        };

        let start = raw_wet + start_frac * range;
        Self {
            moisture: gaussian(start, range * 0.03).clamp(raw_wet, raw_dry),
            temperature: gaussian(18.0, 2.0),
            raw_dry,
            raw_wet,
            center,
            drift_per_sample: drift * range,
            walk_sigma: walk * range,
            mean_reversion: mean_rev,
            noise_sigma: noise * range,
            spike_prob,
            spike_sigma: spike * range,
        }
    }

    fn spike(&self) -> bool {
        fastrand::f32() < self.spike_prob
    }

    /// Next raw moisture count.  Lower is wetter.
    pub fn moisture_raw(&mut self) -> f32 {
        let pull = self.mean_reversion * (self.center - self.moisture);
        let walk = gaussian(0.0, self.walk_sigma);
        let span = self.raw_dry - self.raw_wet;
        self.moisture = (self.moisture + self.drift_per_sample + pull + walk)
            .clamp(self.raw_wet - span * 0.1, self.raw_dry + span * 0.1);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if self.spike() {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        // 10-bit converter range.
        (self.moisture + noise + spike).round().clamp(0.0, 1023.0) as f32
    }

    /// Next temperature reading in °C.
    pub fn temperature_c(&mut self) -> f32 {
        self.temperature = (self.temperature + gaussian(0.0, 0.05)).clamp(-10.0, 45.0);
        if self.spike() {
            return DS18B20_RESET_C as f32;
        }
        // 12-bit resolution
        let reading = self.temperature + gaussian(0.0, 0.06);
        ((reading * 16.0).round() / 16.0) as f32
    }
}

// ---------------------------------------------------------------------------
// Shared world
// ---------------------------------------------------------------------------

/// Power button wired to the simulated PMU.
#[derive(Clone, Default)]
pub struct SimButton {
    latched: Arc<Mutex<IrqStatus>>,
    isr: Arc<Mutex<Option<ShutdownRequest>>>,
}

impl SimButton {
    /// Latch a press.  Returns `false` when no PMU is listening, i.e. the
    /// node is asleep and the PMU handles the press by itself.
    pub fn press(&self, long: bool) -> bool {
        if let Ok(mut irq) = self.latched.lock() {
            irq.short_press |= !long;
            irq.long_press |= long;
        }
        match self.isr.lock().ok().and_then(|isr| isr.clone()) {
            Some(request) => {
                request.raise();
                true
            }
            None => false,
        }
    }

    fn attach(&self, request: ShutdownRequest) -> Result<()> {
        *lock(&self.isr)? = Some(request);
        Ok(())
    }

    fn detach(&self) {
        if let Ok(mut isr) = self.isr.lock() {
            *isr = None;
        }
    }
}

/// Physical state that survives deep sleep.
#[derive(Clone)]
pub struct SimWorld {
    soil: Arc<Mutex<SoilSim>>,
    battery_mv: Arc<Mutex<f64>>,
    sensor_rail: Arc<AtomicBool>,
    button: SimButton,
}

impl SimWorld {
    pub fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        Self {
            soil: Arc::new(Mutex::new(SoilSim::new(scenario, raw_dry, raw_wet))),
            battery_mv: Arc::new(Mutex::new(4150.0)),
            sensor_rail: Arc::new(AtomicBool::new(false)),
            button: SimButton::default(),
        }
    }

    pub fn button(&self) -> SimButton {
        self.button.clone()
    }
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

/// Battery discharge per voltage read.
const DRAIN_MV: f64 = 0.8;
const EMPTY_MV: f64 = 3300.0;

pub struct SimPmu {
    world: SimWorld,
}

impl SimPmu {
    pub fn new(world: SimWorld) -> Self {
        Self { world }
    }
}

impl Drop for SimPmu {
    fn drop(&mut self) {
        self.world.button.detach();
    }
}

impl Pmu for SimPmu {
    fn detect(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_rail(&mut self, rail: Rail, on: bool) -> Result<()> {
        trace!(?rail, on, "sim rail");
        if rail == Rail::Sensors {
            self.world.sensor_rail.store(on, Ordering::Release);
        }
        Ok(())
    }

    fn enable_battery_adc(&mut self) -> Result<()> {
        Ok(())
    }

    fn battery_millivolts(&mut self) -> Result<f32> {
        let mut mv = lock(&self.world.battery_mv)?;
        *mv = (*mv - DRAIN_MV).max(EMPTY_MV);
        Ok(gaussian(*mv, 3.0) as f32)
    }

    fn enable_button_irqs(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_irq(&mut self) -> Result<IrqStatus> {
        Ok(*lock(&self.world.button.latched)?)
    }

    fn clear_irq(&mut self) -> Result<()> {
        *lock(&self.world.button.latched)? = IrqStatus::default();
        Ok(())
    }

    fn attach_button_interrupt(&mut self, request: ShutdownRequest) -> Result<()> {
        self.world.button.attach(request)
    }

    fn shutdown(&mut self) -> Result<()> {
        info!("sim PMU: all outputs off");
        Ok(())
    }
}

pub struct SimProbe {
    world: SimWorld,
}

impl SimProbe {
    pub fn new(world: SimWorld) -> Self {
        Self { world }
    }

    fn powered(&self) -> Result<()> {
        if !self.world.sensor_rail.load(Ordering::Acquire) {
            bail!("no response: sensor rail is off");
        }
        Ok(())
    }
}

impl SoilProbe for SimProbe {
    fn read_temperature_c(&mut self) -> Result<f32> {
        self.powered()?;
        Ok(lock(&self.world.soil)?.temperature_c())
    }

    fn read_moisture_raw(&mut self) -> Result<f32> {
        self.powered()?;
        Ok(lock(&self.world.soil)?.moisture_raw())
    }
}

/// Radio that associates after a fixed delay and may randomly lose the
/// link afterwards.
pub struct SimRadio {
    association: Duration,
    drop_prob: f64,
    begun_at: Option<Instant>,
    dropped: Cell<bool>,
}

impl SimRadio {
    pub fn new(association: Duration, drop_prob: f64) -> Self {
        Self {
            association,
            drop_prob,
            begun_at: None,
            dropped: Cell::new(false),
        }
    }
}

impl Radio for SimRadio {
    fn disconnect(&mut self) -> Result<()> {
        self.begun_at = None;
        Ok(())
    }

    fn begin(&mut self, ssid: &str, _credential: &str) -> Result<()> {
        trace!(ssid, "sim association request");
        self.begun_at = Some(Instant::now());
        self.dropped.set(false);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        let Some(begun) = self.begun_at else {
            return false;
        };
        if self.dropped.get() || begun.elapsed() < self.association {
            return false;
        }
        if fastrand::f64() < self.drop_prob {
            warn!("sim: wireless link dropped");
            self.dropped.set(true);
            return false;
        }
        true
    }

    fn address(&self) -> Option<String> {
        self.is_associated().then(|| "192.168.4.23".to_string())
    }
}

#[derive(Default)]
pub struct SimLed;

impl StatusLed for SimLed {
    fn set(&mut self, on: bool) {
        trace!(on, "status led");
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

pub struct SimBoard {
    world: SimWorld,
    wake: Arc<Notify>,
    power_cut: Arc<Notify>,
}

impl SimBoard {
    pub fn new(cfg: &NodeConfig) -> Result<Self> {
        let scenario = Scenario::parse(&cfg.sim.scenario)
            .ok_or_else(|| anyhow!("unknown sim scenario '{}'", cfg.sim.scenario))?;
        info!(%scenario, "simulated board");
        Ok(Self {
            world: SimWorld::new(
                scenario,
                f64::from(cfg.sampling.raw_dry),
                f64::from(cfg.sampling.raw_wet),
            ),
            wake: Arc::new(Notify::new()),
            power_cut: Arc::new(Notify::new()),
        })
    }

    /// Map Ctrl-C to the power button and SIGUSR1 to the wake button.
    /// Must be called from within the runtime.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let button = self.world.button();
        let power_cut = Arc::clone(&self.power_cut);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("power button: long press");
                if !button.press(true) {
                    power_cut.notify_one();
                }
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut usr1 = signal(SignalKind::user_defined1())?;
            let wake = Arc::clone(&self.wake);
            tokio::spawn(async move {
                while usr1.recv().await.is_some() {
                    info!("wake button pressed");
                    wake.notify_one();
                }
            });
        }
        Ok(())
    }
}

impl Board for SimBoard {
    type Radio = SimRadio;
    type Led = SimLed;
    type Pmu = SimPmu;
    type Probe = SimProbe;
    type Broker = MqttBroker;
    type Updater = TcpUpdateListener;
    type Store = FileEpochStore;

    fn assemble(&mut self, cfg: &NodeConfig) -> Result<BoardParts<Self>> {
        Ok(BoardParts {
            radio: SimRadio::new(
                Duration::from_millis(cfg.sim.association_ms),
                cfg.sim.link_drop_prob,
            ),
            led: SimLed,
            pmu: SimPmu::new(self.world.clone()),
            probe: SimProbe::new(self.world.clone()),
            broker: MqttBroker::new(),
            updater: TcpUpdateListener::new(cfg.update_settings()?),
            store: FileEpochStore::new(cfg.storage.rtc_path.clone()),
        })
    }

    fn wake_button(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn power_cut(&self) -> Arc<Notify> {
        Arc::clone(&self.power_cut)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
