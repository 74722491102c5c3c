//! Find the autopilot's serial port by listening for a heartbeat on each
//! candidate device and baud rate in turn.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::mav::MavlinkLink;
use crate::FcConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub heartbeat: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

impl AutodetectResult {
    /// `serial:<dev>:<baud>` for the chosen port.
    pub fn connection(&self) -> Option<String> {
        self.chosen.as_ref().map(|(d, b)| format!("serial:{}:{}", d, b))
    }
}

pub fn default_candidate_devs() -> Vec<String> {
    ["/dev/serial0", "/dev/ttyAMA0", "/dev/ttyS0", "/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyACM0", "/dev/ttyACM1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

/// Configured candidates first, then anything the OS enumerates that is
/// not already listed.
pub fn candidate_devs(cfg: &FcConfig) -> Vec<String> {
    let mut devs = cfg.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
    match tokio_serial::available_ports() {
        Ok(ports) => {
            for p in ports {
                if !devs.contains(&p.port_name) {
                    devs.push(p.port_name);
                }
            }
        }
        Err(e) => debug!(event = "port_enumeration_failed", error = %e),
    }
    devs
}

/// Blocking. Stops at the first port that yields a heartbeat.
pub fn autodetect_fc(cfg: &FcConfig) -> AutodetectResult {
    let bauds = cfg.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    let timeout = Duration::from_millis(cfg.heartbeat_timeout_ms);
    let mut probes = Vec::new();

    for dev in candidate_devs(cfg) {
        for &baud in &bauds {
            let probe = probe(cfg, &dev, baud, timeout);
            let hit = probe.heartbeat;
            probes.push(probe);
            if hit {
                info!(event = "fc_autodetected", dev = %dev, baud);
                return AutodetectResult { chosen: Some((dev, baud)), probes };
            }
        }
    }
    warn!(event = "fc_autodetect_failed", probes = probes.len());
    AutodetectResult { chosen: None, probes }
}

fn probe(cfg: &FcConfig, dev: &str, baud: u32, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let probe_cfg = FcConfig {
        connection: Some(format!("serial:{}:{}", dev, baud)),
        autodetect: false,
        ..cfg.clone()
    };
    let (heartbeat, note) = match MavlinkLink::open(&probe_cfg) {
        Ok(link) if link.wait_heartbeat(timeout) => (true, "heartbeat".to_string()),
        Ok(_) => (false, "no heartbeat".to_string()),
        Err(e) => {
            debug!(event = "fc_probe_failed", dev, baud, error = %format!("{:#}", e));
            (false, format!("open/connect failed: {:#}", e))
        }
    };
    ProbeResult {
        dev: dev.to_string(),
        baud,
        heartbeat,
        elapsed_ms: start.elapsed().as_millis() as u64,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_for_chosen_port() {
        let r = AutodetectResult { chosen: Some(("/dev/ttyACM0".into(), 115200)), probes: vec![] };
        assert_eq!(r.connection().as_deref(), Some("serial:/dev/ttyACM0:115200"));
        let none = AutodetectResult { chosen: None, probes: vec![] };
        assert!(none.connection().is_none());
    }

    #[test]
    fn configured_devs_come_first() {
        let cfg = FcConfig { candidate_devs: Some(vec!["/dev/does-not-exist".into()]), ..Default::default() };
        assert_eq!(candidate_devs(&cfg)[0], "/dev/does-not-exist");
    }
}
