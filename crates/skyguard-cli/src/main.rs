use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use skyguard_fc::autodetect::autodetect_fc;
use skyguard_fc::mav::MavlinkLink;
use skyguard_fc::report::connection_health;
use skyguard_fc::sim::{SimConfig, SimVehicle};
use skyguard_fc::{
    resolve_profile, FcConfig, FlightSession, ManeuverTimeouts, MissionConfig, NegotiationPolicy, SafetyThresholds,
    SessionConfig, VehicleLink, VehicleProfile, WatchdogConfig,
};
use skyguard_nav::{doctor as nav_doctor, process_waypoints, validate_waypoint_list, GeoPoint, MissionStats};
use skyguard_proto::{CommandResult, FlightCommand, FlightEvent, StampedEvent, WaypointInput};

#[derive(Debug, Parser)]
#[command(name = "skyguard", version, about = "SkyGuard - safety-gated UAV flight control")]
struct Cli {
    #[arg(long)]
    config: String,

    /// Fly the built-in simulated vehicle instead of the configured link.
    #[arg(long)]
    sim: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration file.
    Doctor,
    /// Read JSON-lines commands on stdin; results and events go to stdout.
    Run,
    /// Fly a waypoint file (JSON array of {lat, lon, alt?}).
    Mission {
        file: String,
        /// Arm and climb to this altitude first.
        #[arg(long)]
        takeoff_altitude: Option<f64>,
        /// Process and print the plan without connecting.
        #[arg(long)]
        dry_run: bool,
        /// Planned home for the dry-run distance check, as lat,lon.
        #[arg(long, value_parser = parse_point)]
        home: Option<GeoPoint>,
    },
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
    /// Connect, wait for telemetry and print link health and the safety report.
    Status,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    link: FcConfig,
    safety: SafetyThresholds,
    timeouts: ManeuverTimeouts,
    mission: MissionConfig,
    emergency: NegotiationPolicy,
    watchdog: WatchdogConfig,
}

impl Config {
    fn session(&self) -> SessionConfig {
        SessionConfig {
            safety: self.safety.clone(),
            timeouts: self.timeouts.clone(),
            mission: self.mission.clone(),
            emergency: self.emergency.clone(),
            watchdog: self.watchdog.clone(),
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

fn parse_point(s: &str) -> Result<GeoPoint, String> {
    let (lat, lon) = s.split_once(',').ok_or("expected lat,lon")?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("lat: {}", e))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("lon: {}", e))?;
    Ok(GeoPoint::new(lat, lon))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg, cli.sim),
        Command::Run => {
            let (session, events) = open_session(&cfg, cli.sim).await?;
            serve(session, events, None).await
        }
        Command::Mission { file, takeoff_altitude, dry_run, home } => {
            let waypoints = load_waypoints(&file)?;
            if dry_run {
                return plan(&cfg, &waypoints, home);
            }
            let (session, events) = open_session(&cfg, cli.sim).await?;
            let cmd = FlightCommand::WaypointMission {
                waypoints,
                takeoff_altitude_m: takeoff_altitude,
                post_mission_action: None,
            };
            serve(session, events, Some(cmd)).await
        }
        Command::Fc { cmd } => fc_cmd(&cfg, cli.sim, cmd).await,
    }
}

fn doctor(cfg: &Config, sim: bool) -> Result<()> {
    info!("doctor: starting");
    cfg.session().validate()?;
    nav_doctor::check_pipeline_limits(&cfg.mission.limits(&cfg.safety))?;
    if sim {
        info!("doctor: simulated vehicle, link section not checked");
    } else {
        cfg.link.validate()?;
        if cfg.link.autodetect && cfg.link.connection.is_none() {
            info!("doctor: link autodetect enabled (OK)");
        } else {
            let conn = cfg.link.connection_string()?;
            let profile = resolve_profile(&conn, cfg.link.simulated);
            info!(connection = %conn, profile = ?profile, "doctor: link");
        }
    }
    if !cfg.watchdog.enabled {
        warn!("doctor: watchdogs disabled, link loss and low battery will not be acted on");
    }
    info!("doctor: OK");
    Ok(())
}

fn load_waypoints(path: &str) -> Result<Vec<WaypointInput>> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read waypoint file {}", path))?;
    serde_json::from_str(&s).context("parse waypoint json")
}

/// Dry run: the same processing a live mission does, printed as JSON.
fn plan(cfg: &Config, waypoints: &[WaypointInput], home: Option<GeoPoint>) -> Result<()> {
    if let Some(h) = &home {
        nav_doctor::check_home(h)?;
    }
    let processed = process_waypoints(waypoints, &cfg.mission.limits(&cfg.safety));
    let advisories = validate_waypoint_list(&processed.waypoints, cfg.mission.max_waypoints, home, cfg.safety.max_distance_from_home_m)
        .map_err(anyhow::Error::msg)?;
    let stats = MissionStats::compute(&processed.waypoints);
    let out = json!({
        "waypoints": processed.waypoints,
        "skipped": processed.skipped,
        "merged": processed.merged,
        "warnings": processed.warnings.iter().chain(advisories.iter()).collect::<Vec<_>>(),
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn open_link(cfg: &Config, sim: bool) -> Result<(Arc<dyn VehicleLink>, VehicleProfile)> {
    if sim {
        info!("using simulated vehicle");
        let link: Arc<dyn VehicleLink> = Arc::new(SimVehicle::new(SimConfig::default()));
        return Ok((link, VehicleProfile::Simulated));
    }

    let mut link_cfg = cfg.link.clone();
    if link_cfg.connection.is_none() && link_cfg.serial_dev.is_none() {
        anyhow::ensure!(link_cfg.autodetect, "link: no connection configured and autodetect=false");
        let probe_cfg = link_cfg.clone();
        let res = tokio::task::spawn_blocking(move || autodetect_fc(&probe_cfg))
            .await
            .context("autodetect task")?;
        link_cfg.connection = Some(res.connection().context("fc autodetect failed: no heartbeat found")?);
    }

    let conn = link_cfg.connection_string()?;
    let profile = resolve_profile(&conn, link_cfg.simulated);
    let link = Arc::new(MavlinkLink::open(&link_cfg).context("FC open")?);
    if link_cfg.send_heartbeat_hz > 0.0 {
        link.start_heartbeat(link_cfg.send_heartbeat_hz);
    }

    let wait = Duration::from_millis(link_cfg.heartbeat_timeout_ms);
    let seen = skyguard_fc::wait::wait_for(wait, Duration::from_millis(100), || link.snapshot().connected).await;
    if seen.is_err() {
        warn!(connection = %conn, "no autopilot heartbeat yet; commands will be refused until one arrives");
    }
    let link: Arc<dyn VehicleLink> = link;
    Ok((link, profile))
}

async fn open_session(cfg: &Config, sim: bool) -> Result<(Arc<FlightSession>, mpsc::UnboundedReceiver<FlightEvent>)> {
    let session_cfg = cfg.session();
    session_cfg.validate()?;
    let (link, profile) = open_link(cfg, sim).await?;
    let (tx, rx) = mpsc::unbounded_channel::<FlightEvent>();
    let session = Arc::new(FlightSession::new(link, profile, session_cfg, Arc::new(tx)));
    session.start_watchdogs();
    Ok((session, rx))
}

fn emit(line: serde_json::Value) {
    println!("{}", line);
}

fn result_line(command: &str, res: &CommandResult) -> serde_json::Value {
    json!({ "type": "result", "command": command, "result": res })
}

/// Pump stdin commands into the session until EOF or Ctrl-C. With `first`,
/// that command starts immediately and the session ends when it finishes.
async fn serve(session: Arc<FlightSession>, mut events: mpsc::UnboundedReceiver<FlightEvent>, first: Option<FlightCommand>) -> Result<()> {
    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            match serde_json::to_value(StampedEvent::now(ev)) {
                Ok(v) => emit(v),
                Err(e) => warn!("event encode failed: {}", e),
            }
        }
    });

    let mut primary = first.map(|cmd| {
        let s = session.clone();
        tokio::spawn(async move {
            let name = cmd.name();
            let res = s.execute(cmd).await;
            emit(result_line(name, &res));
        })
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted");
                break;
            }
            done = async {
                match primary.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            }, if primary.is_some() => {
                if let Err(e) = done {
                    warn!("mission task failed: {}", e);
                }
                break;
            }
            line = lines.next_line(), if stdin_open => match line.context("read stdin")? {
                Some(l) if l.trim().is_empty() => {}
                Some(l) => dispatch_line(&session, &l),
                None => {
                    stdin_open = false;
                    if primary.is_none() {
                        break;
                    }
                }
            },
        }
    }

    session.shutdown();
    Ok(())
}

fn dispatch_line(session: &Arc<FlightSession>, line: &str) {
    let cmd: FlightCommand = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            emit(result_line("invalid", &CommandResult::error(format!("bad command: {}", e))));
            return;
        }
    };
    let s = session.clone();
    tokio::spawn(async move {
        let name = cmd.name();
        let res = s.execute(cmd).await;
        emit(result_line(name, &res));
    });
}

async fn fc_cmd(cfg: &Config, sim: bool, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let probe_cfg = cfg.link.clone();
            let res = tokio::task::spawn_blocking(move || autodetect_fc(&probe_cfg))
                .await
                .context("autodetect task")?;
            match &res.chosen {
                Some((dev, baud)) => println!("CHOSEN: {} @ {}", dev, baud),
                None => println!("CHOSEN: none"),
            }
            for p in &res.probes {
                println!("probe dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.heartbeat, p.elapsed_ms, p.note);
            }
            Ok(())
        }
        FcCmd::Status => {
            let (link, profile) = open_link(cfg, sim).await?;
            let snap = link.snapshot();
            println!("link={} profile={:?}", link.describe(), profile);
            println!("connected={}", snap.connected);
            println!("heartbeat_age={:?}", snap.hb_age());
            println!("connection_health={:.1}", connection_health(snap.connected, snap.hb_age()));
            println!("armed={} mode={:?} system_status={:?}", snap.armed, snap.mode, snap.system_status);

            let (tx, _rx) = mpsc::unbounded_channel::<FlightEvent>();
            let session = FlightSession::new(link, profile, cfg.session(), Arc::new(tx));
            let report = session.execute(FlightCommand::SafetyReport).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
