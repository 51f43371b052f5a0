//! Raspberry Pi board: AXP192 PMU, ADS1115 + DS18B20 soil probe,
//! NetworkManager Wi-Fi and GPIO LED / wake button.

mod ads1115;
mod axp192;
mod ds18b20;
mod gpio;
mod net;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::info;

use crate::config::NodeConfig;
use crate::coordinator::{Board, BoardParts};
use crate::mqtt::MqttBroker;
use crate::sampler::SoilProbe;
use crate::storage::FileEpochStore;
use crate::update::TcpUpdateListener;

pub use ads1115::Ads1115;
pub use axp192::Axp192;
pub use ds18b20::Ds18b20;
pub use gpio::{GpioLed, WakeButton};
pub use net::NmcliRadio;

/// DS18B20 for temperature, capacitive probe behind the ADS1115 for
/// moisture.
pub struct PiProbe {
    thermometer: Ds18b20,
    adc: Ads1115,
}

impl SoilProbe for PiProbe {
    fn read_temperature_c(&mut self) -> Result<f32> {
        self.thermometer.read_celsius()
    }

    fn read_moisture_raw(&mut self) -> Result<f32> {
        self.adc.read_raw()
    }
}

pub struct PiBoard {
    wake: Arc<Notify>,
    power_cut: Arc<Notify>,
    _wake_button: WakeButton,
}

impl PiBoard {
    pub fn new(cfg: &NodeConfig) -> Result<Self> {
        let wake = Arc::new(Notify::new());
        let wake_button = WakeButton::arm(cfg.hardware.wake_pin, Arc::clone(&wake))?;
        info!(
            wake_pin = cfg.hardware.wake_pin,
            interface = %cfg.hardware.interface,
            "raspberry pi board"
        );
        Ok(Self {
            wake,
            power_cut: Arc::new(Notify::new()),
            _wake_button: wake_button,
        })
    }

    /// SIGINT stands in for pulling the battery.  Must be called from
    /// within the runtime.
    pub fn install_signal_handlers(&self) -> Result<()> {
        let power_cut = Arc::clone(&self.power_cut);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                power_cut.notify_one();
            }
        });
        Ok(())
    }
}

impl Board for PiBoard {
    type Radio = NmcliRadio;
    type Led = GpioLed;
    type Pmu = Axp192;
    type Probe = PiProbe;
    type Broker = MqttBroker;
    type Updater = TcpUpdateListener;
    type Store = FileEpochStore;

    fn assemble(&mut self, cfg: &NodeConfig) -> Result<BoardParts<Self>> {
        let hw = &cfg.hardware;
        Ok(BoardParts {
            radio: NmcliRadio::new(&hw.interface),
            led: GpioLed::open(hw.led_pin)?,
            pmu: Axp192::open(hw.pmu_irq_pin)?,
            probe: PiProbe {
                thermometer: Ds18b20::locate(hw.ds18b20_id.as_deref())?,
                adc: Ads1115::open(hw.ads1115_address, hw.ads1115_channel)?,
            },
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
