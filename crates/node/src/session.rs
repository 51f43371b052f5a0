//! Secure broker session and telemetry publishing.
//!
//! The session rides on the wireless link: its state is only ever
//! `Connected` while the link is, and [`SecureChannel::ensure_session_alive`]
//! hands control back as soon as the link is gone so the caller can
//! re-associate first.

use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::link::{LinkState, LinkStatus};
use crate::power::{Pmu, PowerController};
use crate::telemetry::TelemetryRecord;

/// Wait between failed handshakes.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Broker address and the single certificate trusted for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// PEM root certificate.  `None` selects a plaintext session.
    pub trust_anchor: Option<Vec<u8>>,
}

/// Message-broker transport.
#[allow(async_fn_in_trait)]
pub trait Broker {
    /// Install the endpoint.  No network traffic.
    fn configure(&mut self, endpoint: Endpoint);
    fn is_connected(&self) -> bool;
    /// Forget the current session without any network traffic.
    fn reset(&mut self);
    /// One handshake attempt, authenticated by the bearer `token`.
    async fn connect(&mut self, client_id: &str, token: &str) -> Result<()>;
    /// Drive keep-alives and drain inbound traffic without blocking long.
    async fn pump(&mut self);
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

pub struct SecureChannel<B> {
    broker: B,
}

impl<B: Broker> SecureChannel<B> {
    /// Bind `broker` to `endpoint`.  The handshake happens later, in
    /// [`ensure_session_alive`](Self::ensure_session_alive).
    pub fn open(mut broker: B, endpoint: Endpoint) -> Self {
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.trust_anchor.is_some(),
            "broker endpoint configured"
        );
        broker.configure(endpoint);
        Self { broker }
    }

    /// Session state, never `Connected` while the link is down.
    pub fn session_state(&self, link: &impl LinkStatus) -> SessionState {
        if link.link_state() != LinkState::Connected {
            return SessionState::Disconnected;
        }
        if self.broker.is_connected() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    /// Handshake until the session is up.
    ///
    /// Retries every [`RETRY_INTERVAL`] without limit.  Returns
    /// `Disconnected` when the link drops, and `Err(PowerOff)` on a long
    /// press serviced between attempts.
    pub async fn ensure_session_alive<P: Pmu>(
        &mut self,
        identity: &str,
        token: &str,
        link: &impl LinkStatus,
        power: &PowerController<P>,
    ) -> Result<SessionState> {
        let mut attempt: u32 = 0;
        loop {
            power.poll_and_service_shutdown()?;

            if link.link_state() != LinkState::Connected {
                debug!("link down, skipping broker handshake");
                return Ok(SessionState::Disconnected);
            }
            if self.broker.is_connected() {
                return Ok(SessionState::Connected);
            }

            attempt += 1;
            info!(client_id = identity, attempt, "connecting to broker");
            match self.broker.connect(identity, token).await {
                Ok(()) => {
                    info!(client_id = identity, "broker session established");
                    return Ok(SessionState::Connected);
                }
                Err(e) => {
                    warn!(attempt, "broker connect failed: {e:#}; retrying in 5 seconds");
                    sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    pub async fn pump(&mut self) {
        self.broker.pump().await;
    }

    /// Drop the session after the link underneath it was replaced.
    pub fn reset(&mut self) {
        if self.broker.is_connected() {
            info!("link re-established, discarding broker session");
        }
        self.broker.reset();
    }

    /// One best-effort publish.  `true` when the transport accepted it.
    pub async fn publish(&mut self, topic: &str, record: &TelemetryRecord) -> bool {
        let payload = match record.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("telemetry not publishable: {e:#}");
                return false;
            }
        };
        match self.broker.publish(topic, payload.into_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(topic, "publish failed: {e:#}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
