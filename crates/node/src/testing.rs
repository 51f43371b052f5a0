//! In-memory fakes shared by the unit tests.
//!
//! Every fake is a cheap handle around `Arc<Mutex<..Log>>`: the test keeps
//! one clone to script behaviour and inspect calls while the code under
//! test owns the other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Notify;

use crate::config::NodeConfig;
use crate::coordinator::{Board, BoardParts, Settings};
use crate::link::{LinkState, LinkStatus, Radio, StatusLed};
use crate::power::{IrqStatus, Pmu, Rail, ShutdownRequest};
use crate::sampler::{SoilProbe, DEFAULT_RAW_DRY, DEFAULT_RAW_WET};
use crate::session::{Broker, Endpoint};
use crate::storage::{BootEpoch, EpochStore};
use crate::telemetry::TELEMETRY_TOPIC;
use crate::update::{StagedImage, UpdateService};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fresh, empty directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("soil-node-{tag}-{}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn settings() -> Settings {
    Settings {
        device_id: 1,
        ssid: "orchard".into(),
        wifi_password: "secret".into(),
        client_id: "soil_quality_sensor".into(),
        access_token: "tok".into(),
        endpoint: Endpoint {
            host: "broker.example".into(),
            port: 8883,
            trust_anchor: None,
        },
        telemetry_topic: TELEMETRY_TOPIC.into(),
        temperature_samples: 5,
        moisture_samples: 5,
        raw_dry: DEFAULT_RAW_DRY,
        raw_wet: DEFAULT_RAW_WET,
        sleep: Duration::from_secs(30),
    }
}

// ---------------------------------------------------------------------------
// PMU
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PmuLog {
    pub missing: bool,
    pub rails: HashMap<Rail, bool>,
    pub rail_writes: usize,
    pub battery_adc: bool,
    pub millivolts: f32,
    pub battery_fails: bool,
    pub button_irqs: bool,
    pub irq: IrqStatus,
    pub irq_reads: usize,
    /// IRQ status reads still to fail.
    pub irq_read_fails: u32,
    pub clears: usize,
    pub attached: Option<ShutdownRequest>,
    pub shutdowns: usize,
}

#[derive(Clone, Default)]
pub struct FakePmu(Arc<Mutex<PmuLog>>);

impl FakePmu {
    pub fn state(&self) -> MutexGuard<'_, PmuLog> {
        lock(&self.0)
    }

    /// Latch a button press and fire the attached interrupt handler.
    pub fn press(&self, long: bool) {
        let mut st = self.state();
        st.irq = IrqStatus {
            short_press: !long,
            long_press: long,
        };
        if let Some(req) = &st.attached {
            req.raise();
        }
    }

    fn sensor_rail_on(&self) -> bool {
        self.state().rails.get(&Rail::Sensors) == Some(&true)
    }
}

impl Pmu for FakePmu {
    fn detect(&mut self) -> Result<()> {
        if self.state().missing {
            bail!("no ACK at PMU address");
        }
        Ok(())
    }

    fn set_rail(&mut self, rail: Rail, on: bool) -> Result<()> {
        let mut st = self.state();
        st.rails.insert(rail, on);
        st.rail_writes += 1;
        Ok(())
    }

    fn enable_battery_adc(&mut self) -> Result<()> {
        self.state().battery_adc = true;
        Ok(())
    }

    fn battery_millivolts(&mut self) -> Result<f32> {
        let st = self.state();
        if st.battery_fails {
            bail!("battery ADC read failed");
        }
        Ok(st.millivolts)
    }

    fn enable_button_irqs(&mut self) -> Result<()> {
        self.state().button_irqs = true;
        Ok(())
    }

    fn read_irq(&mut self) -> Result<IrqStatus> {
        let mut st = self.state();
        st.irq_reads += 1;
        if st.irq_read_fails > 0 {
            st.irq_read_fails -= 1;
            bail!("I2C read of IRQ status failed");
        }
        Ok(st.irq)
    }

    fn clear_irq(&mut self) -> Result<()> {
        let mut st = self.state();
        st.clears += 1;
        st.irq = IrqStatus::default();
        Ok(())
    }

    fn attach_button_interrupt(&mut self, request: ShutdownRequest) -> Result<()> {
        self.state().attached = Some(request);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.state().shutdowns += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Radio & LED
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RadioLog {
    pub begins: Vec<(String, String)>,
    pub disconnects: usize,
    /// Association checks after `begin` that still report "not yet".
    pub polls_until_up: u32,
    checks: u32,
    begun: bool,
    up: bool,
}

#[derive(Clone, Default)]
pub struct FakeRadio(Arc<Mutex<RadioLog>>);

impl FakeRadio {
    pub fn associating_after(polls: u32) -> Self {
        let radio = Self::default();
        radio.state().polls_until_up = polls;
        radio
    }

    pub fn never_associating() -> Self {
        Self::associating_after(u32::MAX)
    }

    pub fn state(&self) -> MutexGuard<'_, RadioLog> {
        lock(&self.0)
    }

    /// Lose the association until the next `begin`.
    pub fn drop_link(&self) {
        let mut st = self.state();
        st.up = false;
        st.begun = false;
    }
}

impl Radio for FakeRadio {
    fn disconnect(&mut self) -> Result<()> {
        let mut st = self.state();
        st.disconnects += 1;
        st.up = false;
        st.begun = false;
        Ok(())
    }

    fn begin(&mut self, ssid: &str, credential: &str) -> Result<()> {
        let mut st = self.state();
        st.begins.push((ssid.to_string(), credential.to_string()));
        st.begun = true;
        st.up = false;
        st.checks = 0;
        Ok(())
    }

    fn is_associated(&self) -> bool {
        let mut st = self.state();
        if !st.begun {
            return false;
        }
        if !st.up {
            st.checks = st.checks.saturating_add(1);
            st.up = st.checks > st.polls_until_up;
        }
        st.up
    }

    fn address(&self) -> Option<String> {
        self.state().up.then(|| "10.0.0.2".to_string())
    }
}

#[derive(Clone, Default)]
pub struct FakeLed(Arc<Mutex<Vec<bool>>>);

impl FakeLed {
    pub fn writes(&self) -> Vec<bool> {
        lock(&self.0).clone()
    }
}

impl StatusLed for FakeLed {
    fn set(&mut self, on: bool) {
        lock(&self.0).push(on);
    }
}

/// Fixed link state for session tests.
pub struct StaticLink(pub LinkState);

impl StaticLink {
    pub fn up() -> Self {
        Self(LinkState::Connected)
    }

    pub fn down() -> Self {
        Self(LinkState::Disconnected)
    }
}

impl LinkStatus for StaticLink {
    fn link_state(&self) -> LinkState {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProbeLog {
    /// Scripted readings, consumed front to back; a default is returned
    /// once empty.
    pub temperatures: Vec<f32>,
    pub moisture_raw: Vec<f32>,
    pub unpowered_reads: usize,
}

/// Probe that only answers while the fake PMU has the sensor rail on.
#[derive(Clone)]
pub struct FakeProbe {
    log: Arc<Mutex<ProbeLog>>,
    pmu: FakePmu,
}

impl FakeProbe {
    pub fn powered_by(pmu: FakePmu) -> Self {
        Self {
            log: Arc::default(),
            pmu,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ProbeLog> {
        lock(&self.log)
    }

    fn read(&self, pick: impl FnOnce(&mut ProbeLog) -> f32) -> Result<f32> {
        let powered = self.pmu.sensor_rail_on();
        let mut st = self.state();
        if !powered {
            st.unpowered_reads += 1;
            bail!("sensor rail is off");
        }
        Ok(pick(&mut st))
    }
}

fn next_or(values: &mut Vec<f32>, default: f32) -> f32 {
    if values.is_empty() {
        default
    } else {
        values.remove(0)
    }
}

impl SoilProbe for FakeProbe {
    fn read_temperature_c(&mut self) -> Result<f32> {
        self.read(|st| next_or(&mut st.temperatures, 20.0))
    }

    fn read_moisture_raw(&mut self) -> Result<f32> {
        self.read(|st| next_or(&mut st.moisture_raw, 552.5))
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct BrokerLog {
    pub endpoint: Option<Endpoint>,
    pub connected: bool,
    pub connect_attempts: u32,
    /// Handshakes still to fail.
    pub fail_connects: u32,
    pub credentials: Vec<(String, String)>,
    pub resets: usize,
    pub pumps: usize,
    pub reject_publish: bool,
    /// Publishes still to fail.
    pub fail_publishes: u32,
    pub publish_attempts: usize,
    pub published: Vec<(String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeBroker(Arc<Mutex<BrokerLog>>);

impl FakeBroker {
    pub fn failing_connects(n: u32) -> Self {
        let broker = Self::default();
        broker.state().fail_connects = n;
        broker
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerLog> {
        lock(&self.0)
    }
}

impl Broker for FakeBroker {
    fn configure(&mut self, endpoint: Endpoint) {
        self.state().endpoint = Some(endpoint);
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn reset(&mut self) {
        let mut st = self.state();
        st.resets += 1;
        st.connected = false;
    }

    async fn connect(&mut self, client_id: &str, token: &str) -> Result<()> {
        let mut st = self.state();
        st.connect_attempts += 1;
        st.credentials.push((client_id.to_string(), token.to_string()));
        if st.fail_connects > 0 {
            st.fail_connects -= 1;
            bail!("TLS handshake failed");
        }
        st.connected = true;
        Ok(())
    }

    async fn pump(&mut self) {
        self.state().pumps += 1;
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut st = self.state();
        st.publish_attempts += 1;
        if st.reject_publish {
            bail!("publish rejected");
        }
        if st.fail_publishes > 0 {
            st.fail_publishes -= 1;
            bail!("publish rejected");
        }
        if !st.connected {
            bail!("not connected");
        }
        st.published.push((topic.to_string(), payload));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Updater & store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct UpdaterLog {
    pub begins: usize,
    pub fail_begin: bool,
    pub handles: usize,
    pub staged: Option<StagedImage>,
}

#[derive(Clone, Default)]
pub struct FakeUpdater(Arc<Mutex<UpdaterLog>>);

impl FakeUpdater {
    pub fn state(&self) -> MutexGuard<'_, UpdaterLog> {
        lock(&self.0)
    }
}

impl UpdateService for FakeUpdater {
    async fn begin(&mut self) -> Result<()> {
        let mut st = self.state();
        st.begins += 1;
        if st.fail_begin {
            bail!("address in use");
        }
        Ok(())
    }

    fn handle(&mut self) -> Result<Option<StagedImage>> {
        let mut st = self.state();
        st.handles += 1;
        Ok(st.staged.take())
    }
}

#[derive(Default)]
pub struct StoreLog {
    pub stored: Option<BootEpoch>,
    pub fail_load: bool,
    pub fail_store: bool,
}

#[derive(Clone, Default)]
pub struct FakeStore(Arc<Mutex<StoreLog>>);

impl FakeStore {
    pub fn state(&self) -> MutexGuard<'_, StoreLog> {
        lock(&self.0)
    }
}

impl EpochStore for FakeStore {
    fn load(&self) -> Result<Option<BootEpoch>> {
        let st = self.state();
        if st.fail_load {
            bail!("corrupt store");
        }
        Ok(st.stored)
    }

    fn store(&mut self, epoch: BootEpoch) -> Result<()> {
        let mut st = self.state();
        if st.fail_store {
            bail!("read-only store");
        }
        st.stored = Some(epoch);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// All fakes wired together.  Fields are the test's handles; `assemble`
/// hands out clones sharing the same state.
pub struct TestBoard {
    pub radio: FakeRadio,
    pub led: FakeLed,
    pub pmu: FakePmu,
    pub probe: FakeProbe,
    pub broker: FakeBroker,
    pub updater: FakeUpdater,
    pub store: FakeStore,
    pub wake: Arc<Notify>,
    pub power_cut: Arc<Notify>,
}

impl Default for TestBoard {
    fn default() -> Self {
        let pmu = FakePmu::default();
        pmu.state().millivolts = 4000.0;
        Self {
            radio: FakeRadio::associating_after(0),
            led: FakeLed::default(),
            probe: FakeProbe::powered_by(pmu.clone()),
            pmu,
            broker: FakeBroker::default(),
            updater: FakeUpdater::default(),
            store: FakeStore::default(),
            wake: Arc::new(Notify::new()),
            power_cut: Arc::new(Notify::new()),
        }
    }
}

impl Board for TestBoard {
    type Radio = FakeRadio;
    type Led = FakeLed;
    type Pmu = FakePmu;
    type Probe = FakeProbe;
    type Broker = FakeBroker;
    type Updater = FakeUpdater;
    type Store = FakeStore;

    fn assemble(&mut self, _cfg: &NodeConfig) -> Result<BoardParts<Self>> {
        Ok(BoardParts {
            radio: self.radio.clone(),
            led: self.led.clone(),
            pmu: self.pmu.clone(),
            probe: self.probe.clone(),
            broker: self.broker.clone(),
            updater: self.updater.clone(),
            store: self.store.clone(),
        })
    }

    fn wake_button(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    fn power_cut(&self) -> Arc<Notify> {
        Arc::clone(&self.power_cut)
    }
}
