//! Station-mode Wi-Fi through NetworkManager.
//!
//! Association requests run `nmcli` in the background so `begin` returns
//! at once; link state is read from the interface's sysfs `operstate`.

use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::link::Radio;

pub struct NmcliRadio {
    interface: String,
    operstate: PathBuf,
    pending: Option<Child>,
}

impl NmcliRadio {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            operstate: PathBuf::from(format!("/sys/class/net/{interface}/operstate")),
            pending: None,
        }
    }

    /// Stop a still-running association attempt.
    fn abandon_pending(&mut self) {
        if let Some(mut child) = self.pending.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!(%status, "previous nmcli finished"),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
        }
    }
}

impl Drop for NmcliRadio {
    fn drop(&mut self) {
        self.abandon_pending();
    }
}

impl Radio for NmcliRadio {
    fn disconnect(&mut self) -> Result<()> {
        self.abandon_pending();
        let status = Command::new("nmcli")
            .args(["device", "disconnect", &self.interface])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("running nmcli")?;
        if !status.success() {
            // Not connected in the first place.
            debug!(%status, "nmcli disconnect");
        }
        Ok(())
    }

    fn begin(&mut self, ssid: &str, credential: &str) -> Result<()> {
        self.abandon_pending();
        let child = Command::new("nmcli")
            .args(["device", "wifi", "connect", ssid, "password", credential])
            .args(["ifname", &self.interface])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning nmcli")?;
        self.pending = Some(child);
        Ok(())
    }

    fn is_associated(&self) -> bool {
        match fs::read_to_string(&self.operstate) {
            Ok(state) => operstate_is_up(&state),
            Err(e) => {
                warn!(path = %self.operstate.display(), "operstate unreadable: {e}");
                false
            }
        }
    }

    fn address(&self) -> Option<String> {
        let out = Command::new("nmcli")
            .args(["-g", "IP4.ADDRESS", "device", "show", &self.interface])
            .output()
            .ok()?;
        parse_ip4_address(&String::from_utf8_lossy(&out.stdout))
    }
}

fn operstate_is_up(state: &str) -> bool {
    state.trim() == "up"
}

/// First address from `nmcli -g IP4.ADDRESS`, without the prefix length.
fn parse_ip4_address(out: &str) -> Option<String> {
    let first = out.split(['|', '\n']).map(str::trim).find(|s| !s.is_empty())?;
    let addr = first.split('/').next().unwrap_or(first);
    Some(addr.to_string())
}
