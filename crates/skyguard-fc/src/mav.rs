//! MAVLink-backed [`VehicleLink`].
//!
//! A reader thread owns the receive side of the connection and folds every
//! message into a shared telemetry record; commands are sent from the
//! caller's thread. `mavlink` connections are blocking, which is why this
//! uses OS threads instead of tokio tasks.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mavlink::{
    common::{
        GpsFixType, MavAutopilot, MavCmd, MavDataStream, MavFrame, MavMessage, MavModeFlag, MavState, MavType,
        PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, RC_CHANNELS_OVERRIDE_DATA,
        REQUEST_DATA_STREAM_DATA, SET_POSITION_TARGET_GLOBAL_INT_DATA, SYS_STATUS_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader,
};
use skyguard_nav::GeoPoint;
use tracing::{debug, info, warn};

use crate::link::VehicleLink;
use crate::lock;
use crate::state::{Attitude, BatteryStatus, FlightMode, GpsStatus, Position, SystemStatus, VehicleSnapshot};
use crate::FcConfig;

type Conn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// Position only; velocity, acceleration and yaw fields ignored.
const POSITION_ONLY_MASK: u16 = 0b0000_1101_1111_1000;
const RC_IGNORE: u16 = u16::MAX;
const RC_RELEASE: u16 = 0;
const STREAM_RATE_HZ: u16 = 4;

#[derive(Debug, Default)]
struct Telemetry {
    last_heartbeat: Option<Instant>,
    armed: bool,
    mode: Option<FlightMode>,
    system_status: Option<SystemStatus>,
    position: Option<Position>,
    attitude: Option<Attitude>,
    battery: BatteryStatus,
    gps: Option<GpsStatus>,
    groundspeed: Option<f32>,
    home: Option<GeoPoint>,
    throttle_pwm: Option<u16>,
}

impl Telemetry {
    fn apply(&mut self, hdr: &MavHeader, msg: &MavMessage, target_sys: u8) {
        if hdr.system_id != target_sys {
            return;
        }
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                // GCS and companion heartbeats share the system id on some setups.
                if matches!(hb.mavtype, MavType::MAV_TYPE_GCS | MavType::MAV_TYPE_ONBOARD_CONTROLLER) {
                    return;
                }
                self.last_heartbeat = Some(Instant::now());
                self.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
                self.mode = Some(FlightMode::from_custom_mode(hb.custom_mode));
                self.system_status = Some(system_status(hb.system_status));
            }
            MavMessage::SYS_STATUS(s) => self.update_battery(s),
            MavMessage::GLOBAL_POSITION_INT(p) => {
                self.position = Some(Position {
                    lat: p.lat as f64 / 1e7,
                    lon: p.lon as f64 / 1e7,
                    alt_rel_m: p.relative_alt as f64 / 1000.0,
                    alt_msl_m: Some(p.alt as f64 / 1000.0),
                });
            }
            MavMessage::GPS_RAW_INT(g) => {
                self.gps = Some(GpsStatus {
                    fix_type: fix_number(g.fix_type),
                    satellites: (g.satellites_visible != u8::MAX).then_some(g.satellites_visible),
                    // eph arrives as HDOP * 100
                    eph: (g.eph != u16::MAX).then(|| g.eph as f32 / 100.0),
                });
            }
            MavMessage::ATTITUDE(a) => {
                self.attitude = Some(Attitude { roll: a.roll, pitch: a.pitch, yaw: a.yaw });
            }
            MavMessage::VFR_HUD(v) => self.groundspeed = Some(v.groundspeed),
            MavMessage::HOME_POSITION(h) => {
                self.home = Some(GeoPoint::new(h.latitude as f64 / 1e7, h.longitude as f64 / 1e7));
            }
            MavMessage::RC_CHANNELS(rc) => {
                self.throttle_pwm = (rc.chan3_raw != 0 && rc.chan3_raw != RC_IGNORE).then_some(rc.chan3_raw);
            }
            _ => {}
        }
    }

    fn update_battery(&mut self, status: &SYS_STATUS_DATA) {
        // millivolts, u16::MAX = not sent
        if status.voltage_battery != u16::MAX {
            self.battery.voltage = Some(status.voltage_battery as f32 / 1000.0);
        }
        // centiamps, -1 = not measured
        if status.current_battery != -1 {
            self.battery.current = Some(status.current_battery as f32 / 100.0);
        }
        if (0..=100).contains(&status.battery_remaining) {
            self.battery.remaining = Some(status.battery_remaining as u8);
        }
    }

    fn snapshot(&self, reader_alive: bool) -> VehicleSnapshot {
        let fix = self.gps.map(|g| g.fix_type).unwrap_or(0);
        VehicleSnapshot {
            connected: reader_alive && self.last_heartbeat.is_some(),
            position: self.position,
            attitude: self.attitude,
            battery: self.battery.clone(),
            gps: self.gps,
            groundspeed_mps: self.groundspeed,
            armed: self.armed,
            armable: self.system_status.map(|s| s.is_armable_state() && fix > 1),
            mode: self.mode,
            heartbeat_age: self.last_heartbeat.map(|t| t.elapsed()),
            home: self.home,
            system_status: self.system_status,
            throttle_pwm: self.throttle_pwm,
        }
    }
}

fn system_status(s: MavState) -> SystemStatus {
    match s {
        MavState::MAV_STATE_UNINIT => SystemStatus::Uninit,
        MavState::MAV_STATE_BOOT => SystemStatus::Boot,
        MavState::MAV_STATE_CALIBRATING => SystemStatus::Calibrating,
        MavState::MAV_STATE_STANDBY => SystemStatus::Standby,
        MavState::MAV_STATE_ACTIVE => SystemStatus::Active,
        MavState::MAV_STATE_CRITICAL => SystemStatus::Critical,
        MavState::MAV_STATE_EMERGENCY => SystemStatus::Emergency,
        MavState::MAV_STATE_POWEROFF => SystemStatus::Poweroff,
        MavState::MAV_STATE_FLIGHT_TERMINATION => SystemStatus::FlightTermination,
    }
}

fn fix_number(f: GpsFixType) -> u8 {
    f as u8
}

struct Shared {
    telemetry: Mutex<Telemetry>,
    stop: AtomicBool,
    reader_alive: AtomicBool,
}

pub struct MavlinkLink {
    conn: Conn,
    shared: Arc<Shared>,
    sys_id: u8,
    comp_id: u8,
    seq: AtomicU8,
    target_sys: u8,
    target_comp: u8,
    label: String,
}

impl MavlinkLink {
    /// Connect and start the reader. Does not wait for a heartbeat; poll
    /// [`VehicleLink::snapshot`] for `connected`.
    pub fn open(cfg: &FcConfig) -> Result<Self> {
        let url = cfg.connection_string()?;
        if let Some((dev, baud)) = serial_target(&url) {
            // fail early with the OS error instead of mavlink's generic one
            drop(
                tokio_serial::new(dev, baud)
                    .open()
                    .with_context(|| format!("open fc serial device {}", dev))?,
            );
        }

        let conn: Conn = Arc::from(mavlink::connect::<MavMessage>(&url).with_context(|| format!("mavlink connect {}", url))?);
        let shared = Arc::new(Shared {
            telemetry: Mutex::new(Telemetry::default()),
            stop: AtomicBool::new(false),
            reader_alive: AtomicBool::new(true),
        });

        spawn_reader(conn.clone(), shared.clone(), cfg.target_sys);
        info!(event = "link_opened", connection = %url);

        let link = Self {
            conn,
            shared,
            sys_id: cfg.sys_id,
            comp_id: cfg.comp_id,
            seq: AtomicU8::new(0),
            target_sys: cfg.target_sys,
            target_comp: cfg.target_comp,
            label: url,
        };
        if let Err(e) = link.request_streams() {
            warn!(event = "stream_request_failed", error = %format!("{:#}", e));
        }
        Ok(link)
    }

    /// Blocking wait for the first autopilot heartbeat.
    pub fn wait_heartbeat(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if lock(&self.shared.telemetry).last_heartbeat.is_some() {
                return true;
            }
            thread::sleep(Duration::from_millis(25));
        }
        false
    }

    /// Companion heartbeat at `hz` until the link is dropped.
    pub fn start_heartbeat(self: &Arc<Self>, hz: f32) {
        let period = Duration::from_secs_f32(1.0 / hz.max(0.1));
        let link = Arc::downgrade(self);
        thread::spawn(move || loop {
            let Some(link) = link.upgrade() else { break };
            if link.shared.stop.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = link.send_heartbeat() {
                debug!(event = "companion_heartbeat_failed", error = %format!("{:#}", e));
            }
            drop(link);
            thread::sleep(period);
        });
    }

    fn send_heartbeat(&self) -> Result<()> {
        let hb = HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        };
        self.send(MavMessage::HEARTBEAT(hb))
    }

    #[allow(deprecated)]
    fn request_streams(&self) -> Result<()> {
        self.send(MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: STREAM_RATE_HZ,
            target_system: self.target_sys,
            target_component: self.target_comp,
            req_stream_id: MavDataStream::MAV_DATA_STREAM_ALL as u8,
            start_stop: 1,
        }))?;
        self.command(MavCmd::MAV_CMD_GET_HOME_POSITION, [0.0; 7])
    }

    fn command(&self, command: MavCmd, p: [f32; 7]) -> Result<()> {
        let cmd = COMMAND_LONG_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            command,
            confirmation: 0,
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: p[3],
            param5: p[4],
            param6: p[5],
            param7: p[6],
        };
        debug!(event = "mav_command", command = ?cmd.command);
        self.send(MavMessage::COMMAND_LONG(cmd))
    }

    fn send(&self, msg: MavMessage) -> Result<()> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.conn.send(&hdr, &msg).context("mavlink send")?;
        Ok(())
    }
}

impl Drop for MavlinkLink {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }
}

fn spawn_reader(conn: Conn, shared: Arc<Shared>, target_sys: u8) {
    thread::spawn(move || {
        let mut errors = 0u64;
        while !shared.stop.load(Ordering::Relaxed) {
            match conn.recv() {
                Ok((hdr, msg)) => lock(&shared.telemetry).apply(&hdr, &msg, target_sys),
                Err(MessageReadError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!(event = "link_closed", error = %e);
                    break;
                }
                Err(MessageReadError::Io(e)) => {
                    errors += 1;
                    if errors % 100 == 1 {
                        debug!(event = "link_read_error", errors, error = %e);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                // CRC or unknown message id; skip the frame
                Err(MessageReadError::Parse(_)) => {}
            }
        }
        shared.reader_alive.store(false, Ordering::Relaxed);
    });
}

/// `serial:/dev/ttyUSB0:57600` -> (`/dev/ttyUSB0`, 57600)
fn serial_target(url: &str) -> Option<(&str, u32)> {
    let rest = url.strip_prefix("serial:")?;
    let (dev, baud) = rest.rsplit_once(':')?;
    Some((dev, baud.parse().ok()?))
}

impl VehicleLink for MavlinkLink {
    fn snapshot(&self) -> VehicleSnapshot {
        let alive = self.shared.reader_alive.load(Ordering::Relaxed);
        lock(&self.shared.telemetry).snapshot(alive)
    }

    fn set_mode(&self, mode: FlightMode) -> Result<()> {
        let flag = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32;
        self.command(MavCmd::MAV_CMD_DO_SET_MODE, [flag, mode.custom_mode() as f32, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn set_armed(&self, armed: bool) -> Result<()> {
        let p1 = if armed { 1.0 } else { 0.0 };
        self.command(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [p1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    fn command_takeoff(&self, altitude_m: f64) -> Result<()> {
        self.command(MavCmd::MAV_CMD_NAV_TAKEOFF, [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude_m as f32])
    }

    fn command_goto(&self, lat: f64, lon: f64, alt_m: f64) -> Result<()> {
        let target = SET_POSITION_TARGET_GLOBAL_INT_DATA {
            time_boot_ms: 0,
            target_system: self.target_sys,
            target_component: self.target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            type_mask: PositionTargetTypemask::from_bits_truncate(POSITION_ONLY_MASK),
            lat_int: (lat * 1e7).round() as i32,
            lon_int: (lon * 1e7).round() as i32,
            alt: alt_m as f32,
            ..Default::default()
        };
        self.send(MavMessage::SET_POSITION_TARGET_GLOBAL_INT(target))
    }

    fn override_throttle(&self, pwm: Option<u16>) -> Result<()> {
        let rc = RC_CHANNELS_OVERRIDE_DATA {
            target_system: self.target_sys,
            target_component: self.target_comp,
            chan1_raw: RC_IGNORE,
            chan2_raw: RC_IGNORE,
            chan3_raw: pwm.unwrap_or(RC_RELEASE),
            chan4_raw: RC_IGNORE,
            chan5_raw: RC_IGNORE,
            chan6_raw: RC_IGNORE,
            chan7_raw: RC_IGNORE,
            chan8_raw: RC_IGNORE,
            ..Default::default()
        };
        self.send(MavMessage::RC_CHANNELS_OVERRIDE(rc))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::GLOBAL_POSITION_INT_DATA;

    fn hdr(sys: u8) -> MavHeader {
        MavHeader { system_id: sys, component_id: 1, sequence: 0 }
    }

    fn autopilot_hb(armed: bool, custom_mode: u32) -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: if armed { MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED } else { MavModeFlag::empty() },
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn heartbeat_sets_mode_and_armed() {
        let mut t = Telemetry::default();
        t.apply(&hdr(1), &autopilot_hb(true, 4), 1);
        let s = t.snapshot(true);
        assert!(s.connected);
        assert!(s.armed);
        assert_eq!(s.mode, Some(FlightMode::Guided));
        assert_eq!(s.system_status, Some(SystemStatus::Active));
    }

    #[test]
    fn other_systems_are_ignored() {
        let mut t = Telemetry::default();
        t.apply(&hdr(7), &autopilot_hb(true, 4), 1);
        assert!(!t.snapshot(true).connected);
    }

    #[test]
    fn sys_status_sentinels_leave_battery_unknown() {
        let mut t = Telemetry::default();
        let status = SYS_STATUS_DATA {
            voltage_battery: u16::MAX,
            current_battery: -1,
            battery_remaining: -1,
            ..Default::default()
        };
        t.apply(&hdr(1), &MavMessage::SYS_STATUS(status), 1);
        assert_eq!(t.battery, BatteryStatus::default());

        let status = SYS_STATUS_DATA {
            voltage_battery: 12_450,
            current_battery: 1_520,
            battery_remaining: 64,
            ..Default::default()
        };
        t.apply(&hdr(1), &MavMessage::SYS_STATUS(status), 1);
        assert_eq!(t.battery.remaining, Some(64));
        assert!((t.battery.voltage.unwrap_or(0.0) - 12.45).abs() < 1e-3);
    }

    #[test]
    fn position_is_scaled_from_int_fields() {
        let mut t = Telemetry::default();
        let p = GLOBAL_POSITION_INT_DATA {
            lat: 473_977_420,
            lon: 85_455_940,
            alt: 488_500,
            relative_alt: 12_300,
            ..Default::default()
        };
        t.apply(&hdr(1), &MavMessage::GLOBAL_POSITION_INT(p), 1);
        let pos = t.snapshot(true).position.expect("position");
        assert!((pos.lat - 47.397742).abs() < 1e-7);
        assert!((pos.alt_rel_m - 12.3).abs() < 1e-9);
    }

    #[test]
    fn parses_serial_connection_strings() {
        assert_eq!(serial_target("serial:/dev/ttyACM0:115200"), Some(("/dev/ttyACM0", 115200)));
        assert_eq!(serial_target("udpin:0.0.0.0:14550"), None);
    }
}
