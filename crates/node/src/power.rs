//! Power management: sensor rail, battery telemetry and the power-button
//! shutdown path.
//!
//! ## Shutdown path
//!
//! ```text
//! Idle ──[button edge]──▶ RequestPending ──[long press]──▶ ShuttingDown
//!  ▲                            │
//!  └───────[short press]────────┘
//! ```
//!
//! The button interrupt only raises a [`ShutdownRequest`].  Everything else
//! (IRQ register access, logging, the power-off command) happens in
//! [`PowerController::poll_and_service_shutdown`], which both the cycle and
//! the shutdown watcher call.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

/// How often the shutdown watcher polls the request flag.
pub const WATCH_TICK: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Interrupt-to-task signal
// ---------------------------------------------------------------------------

/// Single-slot shutdown request raised from interrupt context.
///
/// Cloning shares the same flag.  At most one request is outstanding: a
/// second edge before the first is serviced is absorbed.
#[derive(Clone, Default)]
pub struct ShutdownRequest(Arc<AtomicBool>);

impl ShutdownRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Safe to call from an interrupt callback: one atomic store, nothing
    /// else.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether a request was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// PMU capability
// ---------------------------------------------------------------------------

/// Switchable power outputs on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rail {
    /// Soil probe supply.
    Sensors,
    /// On-board radio module that the node does not use.
    Radio,
    /// GNSS receiver.
    Gnss,
}

/// Latched power-button interrupt causes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqStatus {
    pub short_press: bool,
    pub long_press: bool,
}

/// Register-level access to the power-management IC.
pub trait Pmu {
    /// Probe the chip on its bus.  Failure means the board cannot run.
    fn detect(&mut self) -> Result<()>;
    fn set_rail(&mut self, rail: Rail, on: bool) -> Result<()>;
    fn enable_battery_adc(&mut self) -> Result<()>;
    fn battery_millivolts(&mut self) -> Result<f32>;
    /// Arm short- and long-press detection on the power button.
    fn enable_button_irqs(&mut self) -> Result<()>;
    fn read_irq(&mut self) -> Result<IrqStatus>;
    fn clear_irq(&mut self) -> Result<()>;
    /// Attach a falling-edge handler on the PMU IRQ line that raises
    /// `request` and does nothing else.
    fn attach_button_interrupt(&mut self, request: ShutdownRequest) -> Result<()>;
    /// Cut power.  On real hardware this does not return.
    fn shutdown(&mut self) -> Result<()>;
}

/// Terminal outcome of a long press.  Carried through `anyhow` so every
/// blocking loop unwinds with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerOff;

impl fmt::Display for PowerOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "power button long press: device powered off")
    }
}

impl std::error::Error for PowerOff {}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Inner<P> {
    pmu: P,
    sensor_rail_on: bool,
}

/// Shared handle to the PMU.  Cheap to clone; the cycle and the shutdown
/// watcher each hold one.
pub struct PowerController<P> {
    inner: Arc<Mutex<Inner<P>>>,
    request: ShutdownRequest,
}

impl<P> Clone for PowerController<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            request: self.request.clone(),
        }
    }
}

impl<P: Pmu> PowerController<P> {
    pub fn new(pmu: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pmu,
                sensor_rail_on: false,
            })),
            request: ShutdownRequest::new(),
        }
    }

    /// The flag the button interrupt raises.
    pub fn request(&self) -> ShutdownRequest {
        self.request.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<P>>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("power controller lock poisoned"))
    }

    /// Bring the PMU into its running configuration after a wake.
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.pmu.detect().context("PMU not detected")?;
        info!("PMU detected");

        inner.pmu.set_rail(Rail::Sensors, true)?;
        inner.sensor_rail_on = true;
        inner.pmu.set_rail(Rail::Radio, false)?;
        inner.pmu.set_rail(Rail::Gnss, false)?;
        info!("radio module and GNSS powered off");

        inner.pmu.enable_battery_adc()?;

        inner.pmu.clear_irq()?;
        inner.pmu.enable_button_irqs()?;
        inner.pmu.attach_button_interrupt(self.request.clone())?;
        Ok(())
    }

    /// Service a pending button request.
    ///
    /// Returns `Err(PowerOff)` after the power-off command was issued for a
    /// long press.  With no request pending this touches no registers.
    pub fn poll_and_service_shutdown(&self) -> Result<()> {
        if !self.request.take() {
            return Ok(());
        }

        let mut inner = self.lock()?;
        let irq = match latched_irq(&mut inner.pmu) {
            Ok(irq) => irq,
            Err(e) => {
                // Still latched in the PMU; retry on the next poll.
                self.request.raise();
                return Err(e.context("reading power button IRQ"));
            }
        };

        if !irq.long_press {
            debug!(short_press = irq.short_press, "power button: no long press");
            return Ok(());
        }

        info!("long press detected: shutting down...");
        inner.pmu.shutdown().context("power-off command failed")?;
        Err(PowerOff.into())
    }

    /// Battery voltage in volts.  Single direct read.
    pub fn read_battery_voltage(&self) -> Result<f32> {
        let mv = self.lock()?.pmu.battery_millivolts()?;
        Ok(mv / 1000.0)
    }

    pub fn enable_sensor_rail(&self) -> Result<()> {
        self.set_sensor_rail(true)
    }

    /// Idempotent: a second call while the rail is off does nothing.
    pub fn disable_sensor_rail(&self) -> Result<()> {
        self.set_sensor_rail(false)
    }

    pub fn sensor_rail_on(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.sensor_rail_on)
            .unwrap_or(false)
    }

    fn set_sensor_rail(&self, on: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.sensor_rail_on == on {
            return Ok(());
        }
        inner.pmu.set_rail(Rail::Sensors, on)?;
        inner.sensor_rail_on = on;
        debug!(on, "sensor rail switched");
        Ok(())
    }
}

fn latched_irq<P: Pmu>(pmu: &mut P) -> Result<IrqStatus> {
    let irq = pmu.read_irq()?;
    pmu.clear_irq()?;
    Ok(irq)
}

// ---------------------------------------------------------------------------
// Shutdown watcher activity
// ---------------------------------------------------------------------------

/// Poll the shutdown request every [`WATCH_TICK`] until a long press powers
/// the device off.  Intended to be `tokio::spawn`-ed next to the cycle.
pub async fn watch_shutdown<P: Pmu>(power: PowerController<P>) -> PowerOff {
    let mut ticker = tokio::time::interval(WATCH_TICK);
    loop {
        ticker.tick().await;
        match power.poll_and_service_shutdown() {
            Ok(()) => {}
            Err(e) if e.is::<PowerOff>() => return PowerOff,
            Err(e) => warn!("shutdown watcher: {e:#}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePmu;

    fn initialized() -> (FakePmu, PowerController<FakePmu>) {
        let pmu = FakePmu::default();
        let power = PowerController::new(pmu.clone());
        power.initialize().unwrap();
        (pmu, power)
    }

    // -- ShutdownRequest -----------------------------------------------------

    #[test]
    fn request_take_clears_flag() {
        let req = ShutdownRequest::new();
        assert!(!req.take());
        req.raise();
        assert!(req.is_pending());
        assert!(req.take());
        assert!(!req.is_pending());
        assert!(!req.take());
    }

    #[test]
    fn request_clones_share_flag() {
        let req = ShutdownRequest::new();
        let isr_side = req.clone();
        isr_side.raise();
        isr_side.raise(); // absorbed: single slot
        assert!(req.take());
        assert!(!req.take());
    }

    // -- initialize ----------------------------------------------------------

    #[test]
    fn initialize_configures_rails_and_irqs() {
        let (pmu, power) = initialized();
        let st = pmu.state();
        assert_eq!(st.rails.get(&Rail::Sensors), Some(&true));
        assert_eq!(st.rails.get(&Rail::Radio), Some(&false));
        assert_eq!(st.rails.get(&Rail::Gnss), Some(&false));
        assert!(st.battery_adc);
        assert!(st.button_irqs);
        assert!(st.clears >= 1);
        assert!(st.attached.is_some());
        drop(st);
        assert!(power.sensor_rail_on());
    }

    #[test]
    fn initialize_fails_without_pmu() {
        let pmu = FakePmu::default();
        pmu.state().missing = true;
        let power = PowerController::new(pmu.clone());
        let err = power.initialize().unwrap_err();
        assert!(format!("{err:#}").contains("PMU not detected"));
        assert!(pmu.state().rails.is_empty());
    }

    // -- poll_and_service_shutdown -------------------------------------------

    #[test]
    fn poll_without_request_touches_nothing() {
        let (pmu, power) = initialized();
        let clears_before = pmu.state().clears;
        for _ in 0..5 {
            power.poll_and_service_shutdown().unwrap();
        }
        let st = pmu.state();
        assert_eq!(st.irq_reads, 0);
        assert_eq!(st.clears, clears_before);
        assert_eq!(st.shutdowns, 0);
    }

    #[test]
    fn failed_irq_read_keeps_request_pending() {
        let (pmu, power) = initialized();
        pmu.press(true);
        pmu.state().irq_read_fails = 1;

        let err = power.poll_and_service_shutdown().unwrap_err();
        assert!(!err.is::<PowerOff>());
        assert!(power.request().is_pending());
        assert_eq!(pmu.state().shutdowns, 0);

        let err = power.poll_and_service_shutdown().unwrap_err();
        assert!(err.is::<PowerOff>());
        assert_eq!(pmu.state().shutdowns, 1);
    }

    #[test]
    fn short_press_returns_to_idle() {
        let (pmu, power) = initialized();
        pmu.press(false);
        power.poll_and_service_shutdown().unwrap();

        let st = pmu.state();
        assert_eq!(st.irq_reads, 1);
        assert_eq!(st.shutdowns, 0);
        assert_eq!(st.irq, IrqStatus::default(), "latched irq cleared");
        drop(st);
        assert!(!power.request().is_pending());
    }

    #[test]
    fn long_press_powers_off() {
        let (pmu, power) = initialized();
        pmu.press(true);
        let err = power.poll_and_service_shutdown().unwrap_err();
        assert!(err.is::<PowerOff>());
        assert_eq!(pmu.state().shutdowns, 1);
    }

    #[test]
    fn long_press_latched_without_edge_is_ignored() {
        // Latched cause but the interrupt never fired: nothing to service.
        let (pmu, power) = initialized();
        pmu.state().irq.long_press = true;
        power.poll_and_service_shutdown().unwrap();
        assert_eq!(pmu.state().shutdowns, 0);
    }

    // -- rails & battery -----------------------------------------------------

    #[test]
    fn disable_sensor_rail_is_idempotent() {
        let (pmu, power) = initialized();
        power.disable_sensor_rail().unwrap();
        let writes = pmu.state().rail_writes;
        power.disable_sensor_rail().unwrap();
        power.disable_sensor_rail().unwrap();
        assert_eq!(pmu.state().rail_writes, writes);
        assert!(!power.sensor_rail_on());
        assert_eq!(pmu.state().rails.get(&Rail::Sensors), Some(&false));
    }

    #[test]
    fn enable_sensor_rail_after_disable() {
        let (pmu, power) = initialized();
        power.disable_sensor_rail().unwrap();
        power.enable_sensor_rail().unwrap();
        assert!(power.sensor_rail_on());
        assert_eq!(pmu.state().rails.get(&Rail::Sensors), Some(&true));
    }

    #[test]
    fn battery_voltage_converted_to_volts() {
        let (pmu, power) = initialized();
        pmu.state().millivolts = 3876.1;
        let v = power.read_battery_voltage().unwrap();
        assert!((v - 3.8761).abs() < 1e-5, "got {v}");
    }

    // -- watcher -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn watcher_returns_on_long_press() {
        let (pmu, power) = initialized();
        let watcher = tokio::spawn(watch_shutdown(power.clone()));

        tokio::time::sleep(WATCH_TICK * 3).await;
        assert!(!watcher.is_finished());

        pmu.press(true);
        let off = tokio::time::timeout(WATCH_TICK * 2, watcher)
            .await
            .expect("watcher should react within one tick")
            .unwrap();
        assert_eq!(off, PowerOff);
        assert_eq!(pmu.state().shutdowns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_ignores_short_press() {
        let (pmu, power) = initialized();
        let watcher = tokio::spawn(watch_shutdown(power));

        pmu.press(false);
        tokio::time::sleep(WATCH_TICK * 5).await;
        assert!(!watcher.is_finished());
        assert_eq!(pmu.state().shutdowns, 0);
        watcher.abort();
    }
}
