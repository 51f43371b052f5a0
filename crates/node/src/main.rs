mod config;
mod coordinator;
mod link;
mod logging;
mod mqtt;
mod power;
mod sampler;
mod session;
mod sleep;
mod storage;
mod telemetry;
mod update;

#[cfg(feature = "hw")]
mod hw;
#[cfg(feature = "sim")]
mod sim;
#[cfg(test)]
mod testing;

use std::env;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{error, info};

use config::NodeConfig;
use coordinator::{Board, Coordinator, Settings, SleepRequest};
use power::{watch_shutdown, PowerOff};
use sleep::WakeSources;

#[cfg(not(any(feature = "sim", feature = "hw")))]
compile_error!("enable the `sim` or `hw` feature");

#[cfg(feature = "hw")]
type PlatformBoard = hw::PiBoard;
#[cfg(not(feature = "hw"))]
type PlatformBoard = sim::SimBoard;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    logging::init()?;

    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| config::DEFAULT_CONFIG_PATH.to_string());
    let cfg = config::load(&config_path)?;
    let settings = Settings::from_config(&cfg)?;
    info!(
        path = %config_path,
        device_id = settings.device_id,
        broker = %settings.endpoint.host,
        port = settings.endpoint.port,
        "soil node starting"
    );

    let mut board = PlatformBoard::new(&cfg)?;
    board.install_signal_handlers()?;
    let power_cut = board.power_cut();

    match boot_loop(&mut board, &cfg, &settings).await {
        Ok(()) => {
            info!("powered off");
            Ok(())
        }
        Err(e) => {
            // Parked until power is removed; the button no longer responds.
            error!("fatal: {e:#}");
            power_cut.notified().await;
            info!("power removed");
            Ok(())
        }
    }
}

/// Wake, run, sleep; forever.  Returns `Ok` once the node is powered off.
async fn boot_loop<B: Board>(board: &mut B, cfg: &NodeConfig, settings: &Settings) -> Result<()> {
    let power_cut = board.power_cut();
    loop {
        let Some(request) = wake_period(board, cfg, settings.clone(), &power_cut).await? else {
            return Ok(());
        };

        let mut sources = WakeSources::new();
        sources
            .arm_timer(request.duration)
            .arm_button(board.wake_button());
        tokio::select! {
            cause = sources.deep_sleep() => {
                cause?;
            }
            _ = power_cut.notified() => {
                info!("power removed during sleep");
                return Ok(());
            }
        }
    }
}

/// One wake period with the shutdown watcher running alongside.  Every
/// driver is dropped before returning.  `None` means power-off.
async fn wake_period<B: Board>(
    board: &mut B,
    cfg: &NodeConfig,
    settings: Settings,
    power_cut: &Notify,
) -> Result<Option<SleepRequest>> {
    let parts = board.assemble(cfg)?;
    let mut node = Coordinator::<B>::assemble(parts, settings);
    let mut watcher = tokio::spawn(watch_shutdown(node.power()));

    let outcome = tokio::select! {
        res = async {
            node.wake().await?;
            node.run().await
        } => res.map(Some),
        joined = &mut watcher => match joined {
            Ok(PowerOff) => Ok(None),
            Err(e) => Err(e.into()),
        },
        _ = power_cut.notified() => {
            info!("power removed");
            Ok(None)
        }
    };

    if !watcher.is_finished() {
        watcher.abort();
        let _ = watcher.await;
    }
    drop(node);

    match outcome {
        Ok(Some(request)) => {
            info!(
                boot_epoch = request.boot_epoch.get(),
                seconds = request.duration.as_secs(),
                "wake period complete"
            );
            Ok(Some(request))
        }
        Ok(None) => Ok(None),
        Err(e) if e.is::<PowerOff>() => Ok(None),
        Err(e) => Err(e),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
