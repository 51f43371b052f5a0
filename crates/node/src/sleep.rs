//! Deep sleep and wake sources.
//!
//! Deep sleep is modelled as the boot loop dropping every volatile object
//! and parking here until the first armed source fires.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    Timer,
    Button,
}

/// Wake sources for one sleep period.  Both must be armed before sleeping.
pub struct WakeSources {
    timer: Option<Duration>,
    button: Option<Arc<Notify>>,
}

impl WakeSources {
    pub fn new() -> Self {
        Self {
            timer: None,
            button: None,
        }
    }

    pub fn arm_timer(&mut self, after: Duration) -> &mut Self {
        self.timer = Some(after);
        self
    }

    /// Wake on the button edge signalled through `edge`.
    pub fn arm_button(&mut self, edge: Arc<Notify>) -> &mut Self {
        self.button = Some(edge);
        self
    }

    pub async fn deep_sleep(&self) -> Result<WakeCause> {
        let (Some(after), Some(button)) = (self.timer, self.button.as_ref()) else {
            bail!("refusing to sleep: timer and button wake sources must both be armed");
        };
        info!(seconds = after.as_secs(), "entering deep sleep");

        let cause = tokio::select! {
            _ = sleep(after) => WakeCause::Timer,
            _ = button.notified() => WakeCause::Button,
        };
        info!(?cause, "woke up");
        Ok(cause)
    }
}

impl Default for WakeSources {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn timer_wakes_after_interval() {
        let mut wake = WakeSources::new();
        wake.arm_timer(Duration::from_secs(30))
            .arm_button(Arc::new(Notify::new()));

        let start = Instant::now();
        assert_eq!(wake.deep_sleep().await.unwrap(), WakeCause::Timer);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn button_wakes_early() {
        let button = Arc::new(Notify::new());
        let mut wake = WakeSources::new();
        wake.arm_timer(Duration::from_secs(30))
            .arm_button(Arc::clone(&button));

        let presser = Arc::clone(&button);
        tokio::spawn(async move {
            sleep(Duration::from_secs(4)).await;
            presser.notify_one();
        });

        let start = Instant::now();
        assert_eq!(wake.deep_sleep().await.unwrap(), WakeCause::Button);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn refuses_without_timer() {
        let mut wake = WakeSources::new();
        wake.arm_button(Arc::new(Notify::new()));
        assert!(wake.deep_sleep().await.is_err());
    }

    #[tokio::test]
    async fn refuses_without_button() {
        let mut wake = WakeSources::new();
        wake.arm_timer(Duration::from_secs(1));
        assert!(wake.deep_sleep().await.is_err());
    }
}
