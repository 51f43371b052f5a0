//! Wireless link bring-up.
//!
//! Association retries forever on a fixed tick.  Each tick toggles the
//! heartbeat LED and gives the power controller a chance to honour a long
//! press, which is the only way out of a link that never comes up.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::power::{Pmu, PowerController};

/// Association poll tick.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause between dropping the old association and issuing the new one.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Station-mode wireless interface.
pub trait Radio {
    /// Drop any current association.  No-op when not associated.
    fn disconnect(&mut self) -> Result<()>;
    /// Issue an association request.  Must not block on the outcome.
    fn begin(&mut self, ssid: &str, credential: &str) -> Result<()>;
    fn is_associated(&self) -> bool;
    /// Address assigned on the link, for diagnostics.
    fn address(&self) -> Option<String>;
}

/// Heartbeat indicator toggled while waiting for the link.
pub trait StatusLed {
    fn set(&mut self, on: bool);
}

/// Read-only view of the link used by the session layer.
pub trait LinkStatus {
    fn link_state(&self) -> LinkState;
}

pub struct LinkManager<R, L> {
    radio: R,
    led: L,
    led_on: bool,
    state: LinkState,
    ssid: String,
    credential: String,
}

impl<R: Radio, L: StatusLed> LinkManager<R, L> {
    pub fn new(radio: R, mut led: L) -> Self {
        led.set(false);
        Self {
            radio,
            led,
            led_on: false,
            state: LinkState::Disconnected,
            ssid: String::new(),
            credential: String::new(),
        }
    }

    /// Associate with `ssid`, blocking until connected or powered off.
    pub async fn connect<P: Pmu>(
        &mut self,
        ssid: &str,
        credential: &str,
        power: &PowerController<P>,
    ) -> Result<()> {
        self.ssid = ssid.to_string();
        self.credential = credential.to_string();
        self.associate(power).await
    }

    /// Re-issue the association with the credentials from [`connect`].
    ///
    /// [`connect`]: LinkManager::connect
    pub async fn reconnect<P: Pmu>(&mut self, power: &PowerController<P>) -> Result<()> {
        info!(ssid = %self.ssid, "wireless link lost");
        self.associate(power).await
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    async fn associate<P: Pmu>(&mut self, power: &PowerController<P>) -> Result<()> {
        info!(ssid = %self.ssid, "connecting to wireless network");
        self.state = LinkState::Connecting;

        self.radio.disconnect()?;
        sleep(SETTLE_DELAY).await;
        self.radio.begin(&self.ssid, &self.credential)?;

        let mut polls: u32 = 0;
        while !self.radio.is_associated() {
            sleep(POLL_INTERVAL).await;
            polls += 1;
            self.led_on = !self.led_on;
            self.led.set(self.led_on);
            debug!(polls, "waiting for association");

            power.poll_and_service_shutdown()?;
        }

        self.state = LinkState::Connected;
        info!(
            address = self.radio.address().as_deref().unwrap_or("unknown"),
            polls,
            "wireless link up"
        );

        if self.led_on {
            self.led_on = false;
            self.led.set(false);
        }
        Ok(())
    }
}

impl<R: Radio, L> LinkStatus for LinkManager<R, L> {
    fn link_state(&self) -> LinkState {
        match self.state {
            LinkState::Connected if !self.radio.is_associated() => LinkState::Disconnected,
            s => s,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
