//! Duty-cycle coordinator.
//!
//! One wake period, from power-up to the deep-sleep request:
//!
//! ```text
//!   wake ──▶ PMU init ──▶ link up ──▶ update listener ──▶ pass loop
//!                                                          │
//!        ┌─────────────────────────────────────────────────┘
//!        ▼
//!   update / shutdown poll ─▶ session alive? ─▶ pump ─▶ link up?
//!        ▲                                                │ no ──▶ reconnect ─┐
//!        │                                                ▼ yes               │
//!        │                                   sample ─▶ publish ─▶ ok ──▶ SleepRequest
//!        │                                                │ failed            │
//!        └────────────────── idle 100 ms ◀────────────────┴───────────────────┘
//! ```
//!
//! A long press surfaces as `Err(PowerOff)` from whichever step was
//! running and ends the wake period.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::link::{LinkManager, Radio, StatusLed};
use crate::power::{Pmu, PowerController, PowerOff};
use crate::sampler::{moisture_percent, sample_median, SoilProbe};
use crate::session::{Broker, Endpoint, SecureChannel, SessionState};
use crate::storage::{BootEpoch, EpochStore};
use crate::telemetry::TelemetryRecord;
use crate::update::UpdateService;

/// Pause at the end of every pass.
pub const LOOP_IDLE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// A hardware (or simulated) platform the node can run on.
pub trait Board {
    type Radio: Radio;
    type Led: StatusLed;
    type Pmu: Pmu + Send + 'static;
    type Probe: SoilProbe;
    type Broker: Broker;
    type Updater: UpdateService;
    type Store: EpochStore;

    /// Fresh drivers for one wake period.
    fn assemble(&mut self, cfg: &NodeConfig) -> Result<BoardParts<Self>>
    where
        Self: Sized;

    /// Signalled by the wake button edge.
    fn wake_button(&self) -> Arc<Notify>;

    /// Signalled when power is removed outside the shutdown watcher's reach.
    fn power_cut(&self) -> Arc<Notify>;
}

pub struct BoardParts<B: Board> {
    pub radio: B::Radio,
    pub led: B::Led,
    pub pmu: B::Pmu,
    pub probe: B::Probe,
    pub broker: B::Broker,
    pub updater: B::Updater,
    pub store: B::Store,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The slice of [`NodeConfig`] the cycle needs, with the trust anchor
/// already loaded.
#[derive(Debug, Clone)]
pub struct Settings {
    pub device_id: u32,
    pub ssid: String,
    pub wifi_password: String,
    pub client_id: String,
    pub access_token: String,
    pub endpoint: Endpoint,
    pub telemetry_topic: String,
    pub temperature_samples: usize,
    pub moisture_samples: usize,
    pub raw_dry: f32,
    pub raw_wet: f32,
    pub sleep: Duration,
}

impl Settings {
    pub fn from_config(cfg: &NodeConfig) -> Result<Self> {
        let trust_anchor = cfg
            .broker
            .ca_cert
            .as_deref()
            .map(read_trust_anchor)
            .transpose()?;
        Ok(Self {
            device_id: cfg.device.tree_id,
            ssid: cfg.wifi.ssid.clone(),
            wifi_password: cfg.wifi.password.clone(),
            client_id: cfg.broker.client_id.clone(),
            access_token: cfg.broker.access_token.clone(),
            endpoint: Endpoint {
                host: cfg.broker.host.clone(),
                port: cfg.broker.port,
                trust_anchor,
            },
            telemetry_topic: cfg.broker.telemetry_topic.clone(),
            temperature_samples: cfg.sampling.temperature_samples,
            moisture_samples: cfg.sampling.moisture_samples,
            raw_dry: cfg.sampling.raw_dry,
            raw_wet: cfg.sampling.raw_wet,
            sleep: cfg.sleep.duration(),
        })
    }
}

fn read_trust_anchor(path: &Path) -> Result<Vec<u8>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read CA certificate: {}", path.display()))?;
    anyhow::ensure!(
        pem.starts_with(b"-----BEGIN"),
        "CA certificate {} is not PEM",
        path.display()
    );
    Ok(pem)
}

// ---------------------------------------------------------------------------
// Device context
// ---------------------------------------------------------------------------

/// Per-wake device state.  Only the boot epoch outlives deep sleep, through
/// the store.
pub struct DeviceContext<S> {
    store: S,
    boot_epoch: BootEpoch,
}

impl<S: EpochStore> DeviceContext<S> {
    pub fn restore(store: S) -> Self {
        let boot_epoch = match store.load() {
            Ok(Some(epoch)) => epoch,
            Ok(None) => {
                info!("no stored boot epoch: first boot since power-up");
                BootEpoch::FIRST
            }
            Err(e) => {
                warn!("boot epoch unreadable, starting over: {e:#}");
                BootEpoch::FIRST
            }
        };
        Self { store, boot_epoch }
    }

    pub fn boot_epoch(&self) -> BootEpoch {
        self.boot_epoch
    }

    /// Count one successful publish and persist the new value.
    pub fn advance(&mut self) -> BootEpoch {
        self.boot_epoch = self.boot_epoch.next();
        if let Err(e) = self.store.store(self.boot_epoch) {
            warn!(boot_epoch = self.boot_epoch.get(), "boot epoch not persisted: {e:#}");
        }
        self.boot_epoch
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Record accepted by the transport; `boot_epoch` is the advanced value.
    Published {
        record: TelemetryRecord,
        boot_epoch: BootEpoch,
    },
    PublishFailed,
    /// The link was down and has been re-established; nothing sampled.
    LinkRestored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRequest {
    pub duration: Duration,
    pub boot_epoch: BootEpoch,
}

pub struct Coordinator<B: Board> {
    settings: Settings,
    ctx: DeviceContext<B::Store>,
    power: PowerController<B::Pmu>,
    link: LinkManager<B::Radio, B::Led>,
    channel: SecureChannel<B::Broker>,
    probe: B::Probe,
    updater: B::Updater,
}

impl<B: Board> Coordinator<B> {
    /// Wire the parts together.  No hardware access beyond loading the
    /// boot epoch.
    pub fn assemble(parts: BoardParts<B>, settings: Settings) -> Self {
        let ctx = DeviceContext::restore(parts.store);
        info!(boot_epoch = ctx.boot_epoch().get(), "waking up");
        Self {
            ctx,
            power: PowerController::new(parts.pmu),
            link: LinkManager::new(parts.radio, parts.led),
            channel: SecureChannel::open(parts.broker, settings.endpoint.clone()),
            probe: parts.probe,
            updater: parts.updater,
            settings,
        }
    }

    /// Handle for the shutdown watcher.
    pub fn power(&self) -> PowerController<B::Pmu> {
        self.power.clone()
    }

    pub fn boot_epoch(&self) -> BootEpoch {
        self.ctx.boot_epoch()
    }

    /// Power-up sequence: PMU, link, update listener.  Blocks until the
    /// link is up.
    pub async fn wake(&mut self) -> Result<()> {
        self.power.initialize()?;
        self.link
            .connect(&self.settings.ssid, &self.settings.wifi_password, &self.power)
            .await?;
        if let Err(e) = self.updater.begin().await {
            warn!("update listener unavailable: {e:#}");
        }
        Ok(())
    }

    /// Run passes until one publishes.
    pub async fn run(&mut self) -> Result<SleepRequest> {
        loop {
            match self.run_cycle().await {
                Ok(CycleOutcome::Published { boot_epoch, .. }) => {
                    info!("going to sleep until next TX...");
                    return Ok(SleepRequest {
                        duration: self.settings.sleep,
                        boot_epoch,
                    });
                }
                Ok(CycleOutcome::PublishFailed | CycleOutcome::LinkRestored) => {}
                Err(e) if e.is::<PowerOff>() => return Err(e),
                Err(e) => warn!("cycle pass failed: {e:#}"),
            }
            sleep(LOOP_IDLE).await;
        }
    }

    /// One pass of the cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        match self.updater.handle() {
            Ok(Some(image)) => info!(
                path = %image.path.display(),
                bytes = image.bytes,
                "firmware image staged for next boot"
            ),
            Ok(None) => {}
            Err(e) => warn!("update not applied: {e:#}"),
        }
        self.power.poll_and_service_shutdown()?;

        if self.channel.session_state(&self.link) != SessionState::Connected {
            self.channel
                .ensure_session_alive(
                    &self.settings.client_id,
                    &self.settings.access_token,
                    &self.link,
                    &self.power,
                )
                .await?;
        }
        self.channel.pump().await;

        if !self.link.is_connected() {
            self.link.reconnect(&self.power).await?;
            // The old socket did not survive the re-association.
            self.channel.reset();
            return Ok(CycleOutcome::LinkRestored);
        }

        let record = self.sample().await?;
        if !self
            .channel
            .publish(&self.settings.telemetry_topic, &record)
            .await
        {
            warn!("failed to publish data");
            return Ok(CycleOutcome::PublishFailed);
        }

        let boot_epoch = self.ctx.advance();
        info!(
            boot_cnt = record.boot_epoch,
            soil_temperature = record.soil_temperature_c,
            soil_moisture = record.soil_moisture_percent,
            bat_voltage = record.battery_voltage_v,
            "telemetry published"
        );
        Ok(CycleOutcome::Published { record, boot_epoch })
    }

    /// Power the probe, take the readings and power it down again.  The
    /// rail is switched off even when a reading fails.
    async fn sample(&mut self) -> Result<TelemetryRecord> {
        self.power.enable_sensor_rail()?;
        let readings = self.read_sensors().await;
        let rail_off = self.power.disable_sensor_rail();
        let (temperature, moisture, battery) = readings?;
        rail_off?;

        Ok(TelemetryRecord {
            device_id: self.settings.device_id,
            boot_epoch: self.ctx.boot_epoch().get(),
            soil_temperature_c: temperature,
            soil_moisture_percent: moisture,
            battery_voltage_v: battery,
        })
    }

    async fn read_sensors(&mut self) -> Result<(f32, f32, f32)> {
        let s = &self.settings;
        let probe = &mut self.probe;

        let temperature = sample_median(|| probe.read_temperature_c(), s.temperature_samples).await;
        let moisture = sample_median(
            || {
                probe
                    .read_moisture_raw()
                    .map(|raw| moisture_percent(raw, s.raw_dry, s.raw_wet))
            },
            s.moisture_samples,
        )
        .await;
        let battery = self.power.read_battery_voltage()?;
        Ok((temperature, moisture, battery))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
