//! MQTT transport for the broker session, built on `rumqttc`.
//!
//! The event loop is driven inline rather than from a spawned task: connect
//! polls until CONNACK, publish polls until the packet is written, and
//! [`Broker::pump`] drains whatever is pending within a short budget.  This
//! keeps the session strictly inside the cycle and lets it be dropped as a
//! unit on deep sleep.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::session::{Broker, Endpoint};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// Time `pump` waits for the next event before giving the loop back.
const PUMP_WAIT: Duration = Duration::from_millis(10);
/// Requests the client may queue before `try_publish` refuses.
const REQUEST_CAPACITY: usize = 10;

/// Build client options: the access token goes in the username field and
/// the trust anchor, when present, is the only CA accepted.
pub fn mqtt_options(endpoint: &Endpoint, client_id: &str, token: &str) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    opts.set_keep_alive(KEEP_ALIVE);
    opts.set_clean_session(true);
    opts.set_credentials(token, "");
    if let Some(ca) = &endpoint.trust_anchor {
        opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: ca.clone(),
            alpn: None,
            client_auth: None,
        }));
    }
    opts
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[derive(Default)]
pub struct MqttBroker {
    endpoint: Option<Endpoint>,
    session: Option<Session>,
}

impl MqttBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_session(&mut self, reason: &str) {
        if self.session.take().is_some() {
            warn!(reason, "broker session dropped");
        }
    }
}

impl Broker for MqttBroker {
    fn configure(&mut self, endpoint: Endpoint) {
        self.endpoint = Some(endpoint);
        self.session = None;
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn reset(&mut self) {
        self.drop_session("reset");
    }

    async fn connect(&mut self, client_id: &str, token: &str) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| anyhow!("broker endpoint not configured"))?;
        let opts = mqtt_options(endpoint, client_id, token);
        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);

        timeout(CONNECT_TIMEOUT, await_connack(&mut eventloop))
            .await
            .map_err(|_| anyhow!("no CONNACK within {CONNECT_TIMEOUT:?}"))??;

        self.session = Some(Session { client, eventloop });
        Ok(())
    }

    async fn pump(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        loop {
            match timeout(PUMP_WAIT, session.eventloop.poll()).await {
                Err(_) => return,
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    self.drop_session("broker sent DISCONNECT");
                    return;
                }
                Ok(Ok(event)) => debug!(?event, "mqtt event"),
                Ok(Err(e)) => {
                    self.drop_session(&e.to_string());
                    return;
                }
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            bail!("not connected to broker");
        };
        session
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .context("queueing publish")?;

        let flushed = timeout(PUBLISH_TIMEOUT, await_publish_written(&mut session.eventloop)).await;
        match flushed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.drop_session("connection error during publish");
                Err(e)
            }
            Err(_) => Err(anyhow!("publish not written within {PUBLISH_TIMEOUT:?}")),
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await.context("broker connection failed")? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                bail!("broker refused connection: {:?}", ack.code);
            }
            event => debug!(?event, "mqtt event before CONNACK"),
        }
    }
}

async fn await_publish_written(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await.context("broker connection lost")? {
            Event::Outgoing(Outgoing::Publish(_)) => return Ok(()),
            event => debug!(?event, "mqtt event while publishing"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
