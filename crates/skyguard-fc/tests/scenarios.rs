//! Whole-session flights against the simulated vehicle, in virtual time.

use std::sync::Arc;
use std::time::Duration;

use skyguard_fc::sim::{SimCommand, SimConfig, SimVehicle};
use skyguard_fc::state::GpsStatus;
use skyguard_fc::{FlightMode, FlightSession, ManeuverState, SessionConfig, VehicleLink, VehicleProfile};
use skyguard_nav::GeoPoint;
use skyguard_proto::{EmergencyResolution, FlightCommand, FlightEvent, PostMissionAction, Status, WaypointInput};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn session(v: &Arc<SimVehicle>) -> (Arc<FlightSession>, broadcast::Receiver<FlightEvent>) {
    let (tx, rx) = broadcast::channel(4096);
    let link: Arc<dyn VehicleLink> = v.clone();
    let s = FlightSession::new(link, VehicleProfile::Simulated, SessionConfig::default(), Arc::new(tx));
    (Arc::new(s), rx)
}

fn drain(rx: &mut broadcast::Receiver<FlightEvent>, into: &mut Vec<FlightEvent>) {
    loop {
        match rx.try_recv() {
            Ok(ev) => into.push(ev),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

async fn until_disarmed(v: &SimVehicle, within: Duration) -> bool {
    timeout(within, async {
        while v.is_armed() {
            sleep(Duration::from_millis(500)).await;
        }
    })
    .await
    .is_ok()
}

/// `meters` due north of `p`.
fn north(p: GeoPoint, meters: f64) -> GeoPoint {
    GeoPoint::new(p.lat + meters / 111_195.0, p.lon)
}

#[tokio::test(start_paused = true)]
async fn battery_emergency_mid_mission_lands_where_operator_says() {
    let cfg = SimConfig { battery_percent: 80.0, drain_per_meter: 0.4, ..Default::default() };
    let home = cfg.start;
    let v = Arc::new(SimVehicle::new(cfg));
    let (s, mut rx) = session(&v);

    let waypoints: Vec<WaypointInput> = [100.0, 200.0, 300.0]
        .iter()
        .map(|m| {
            let p = north(home, *m);
            WaypointInput { lat: p.lat, lon: p.lon, alt: Some(10.0) }
        })
        .collect();

    let runner = s.clone();
    let mission = tokio::spawn(async move {
        runner
            .execute(FlightCommand::WaypointMission { waypoints, takeoff_altitude_m: Some(10.0), post_mission_action: None })
            .await
    });

    let mut events = Vec::new();
    let prompt_id = loop {
        let ev = rx.recv().await.expect("event channel open");
        let id = match &ev {
            FlightEvent::EmergencyPrompt { prompt_id, .. } => Some(prompt_id.clone()),
            _ => None,
        };
        events.push(ev);
        if let Some(id) = id {
            break id;
        }
    };
    assert!(prompt_id.starts_with("battery_emergency_"));

    let ack = s.execute(FlightCommand::EmergencyResponse { prompt_id: prompt_id.clone(), choice: "land".into() }).await;
    assert!(ack.is_ok(), "{}", ack.detail);

    let res = mission.await.expect("mission task");
    assert_eq!(res.status, Status::Warning, "{}", res.detail);
    assert!(res.detail.contains("OperatorLand"), "{}", res.detail);
    let report = res.payload.as_ref().expect("mission report");
    assert_eq!(report["status"], "aborted");
    assert_eq!(report["end"]["end"], "battery_emergency");
    assert_eq!(report["completed_waypoints"], 1);

    assert!(!v.is_armed());
    let (at, alt) = v.position();
    assert_eq!(alt, 0.0);
    // between the first and second waypoint, nowhere near home
    let from_home = home.distance_to(&at);
    assert!(from_home > 100.0 && from_home < 200.0, "landed {:.0}m from home", from_home);
    assert!(!v.commands().contains(&SimCommand::SetMode(FlightMode::Rtl)));
    assert_eq!(s.controller().state(), ManeuverState::Disarmed);

    drain(&mut rx, &mut events);
    assert!(events.iter().any(|e| matches!(e, FlightEvent::WaypointReached { waypoint: 1, .. })));
    assert!(!events.iter().any(|e| matches!(e, FlightEvent::WaypointReached { waypoint: 2, .. })));
    assert!(events.iter().any(|e| matches!(e, FlightEvent::MissionAborted { completed_waypoints: 1, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        FlightEvent::EmergencyAction { resolution: EmergencyResolution::OperatorLand, maneuver_ok: true, .. }
    )));

    // exactly one answer per prompt
    let again = s.execute(FlightCommand::EmergencyResponse { prompt_id, choice: "RTL".into() }).await;
    assert_eq!(again.status, Status::Error);
}

#[tokio::test(start_paused = true)]
async fn unanswered_prompt_during_hold_returns_home() {
    let v = Arc::new(SimVehicle::new(SimConfig::default()));
    let (s, mut rx) = session(&v);

    assert!(s.execute(FlightCommand::Arm).await.is_ok());
    let runner = s.clone();
    let hold = tokio::spawn(async move {
        runner.execute(FlightCommand::TimedHold { altitude_m: 10.0, duration_s: 120.0 }).await
    });

    assert!(s.wait_for_state(ManeuverState::Holding, Duration::from_secs(30)).await);
    v.set_battery(22.0);

    let res = hold.await.expect("hold task");
    assert_eq!(res.status, Status::Warning, "{}", res.detail);
    assert!(res.detail.contains("TimeoutRtl"), "{}", res.detail);
    assert!(!v.is_armed());
    assert!(v.commands().contains(&SimCommand::SetMode(FlightMode::Rtl)));

    let mut events = Vec::new();
    drain(&mut rx, &mut events);
    let countdowns = events.iter().filter(|e| matches!(e, FlightEvent::EmergencyCountdown { .. })).count();
    assert!(countdowns >= 8, "only {} countdown updates", countdowns);
    assert!(events.iter().any(|e| matches!(
        e,
        FlightEvent::EmergencyAction { resolution: EmergencyResolution::TimeoutRtl, maneuver_ok: true, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn rtl_without_home_lands_in_place() {
    let cfg = SimConfig { home: None, ..Default::default() };
    let at = north(cfg.start, 40.0);
    let v = Arc::new(SimVehicle::new(cfg));
    v.place_airborne(at, 8.0, FlightMode::Guided);
    let (s, _rx) = session(&v);

    let res = s.execute(FlightCommand::Rtl { emergency_override: false }).await;
    assert!(res.is_ok(), "{}", res.detail);
    assert!(!v.is_armed());
    assert!(v.position().0.distance_to(&at) < 1.0);

    let cmds = v.commands();
    assert!(cmds.contains(&SimCommand::SetMode(FlightMode::Land)));
    assert!(!cmds.contains(&SimCommand::SetMode(FlightMode::Rtl)));
}

#[tokio::test(start_paused = true)]
async fn null_island_home_makes_land_stay_put() {
    let cfg = SimConfig::default();
    let at = north(cfg.start, 25.0);
    let v = Arc::new(SimVehicle::new(cfg));
    v.set_home(Some(GeoPoint::new(0.0, 0.0)));
    v.place_airborne(at, 5.0, FlightMode::Guided);
    let (s, _rx) = session(&v);

    let verify = s.execute(FlightCommand::VerifyHome).await;
    assert_eq!(verify.status, Status::Error);

    let res = s.execute(FlightCommand::Land { force_here: false, emergency_override: false }).await;
    assert!(res.is_ok(), "{}", res.detail);
    assert!(!v.is_armed());
    assert!(v.position().0.distance_to(&at) < 1.0);
    assert!(!v.commands().contains(&SimCommand::SetMode(FlightMode::Rtl)));
}

#[tokio::test(start_paused = true)]
async fn one_flight_command_at_a_time_and_override_ends_hold() {
    let v = Arc::new(SimVehicle::new(SimConfig::default()));
    let (s, _rx) = session(&v);

    assert!(s.execute(FlightCommand::Arm).await.is_ok());
    let runner = s.clone();
    let hold = tokio::spawn(async move {
        runner.execute(FlightCommand::TimedHold { altitude_m: 10.0, duration_s: 200.0 }).await
    });
    assert!(s.wait_for_state(ManeuverState::Holding, Duration::from_secs(30)).await);

    let status = s.execute(FlightCommand::MissionStatus).await;
    assert!(status.detail.starts_with("holding"), "{}", status.detail);

    let p = north(SimConfig::default().start, 30.0);
    let second = s
        .execute(FlightCommand::WaypointMission {
            waypoints: vec![WaypointInput { lat: p.lat, lon: p.lon, alt: None }],
            takeoff_altitude_m: None,
            post_mission_action: None,
        })
        .await;
    assert_eq!(second.status, Status::Error);
    assert!(second.detail.contains("already in progress"), "{}", second.detail);

    let rtl = s.execute(FlightCommand::Rtl { emergency_override: false }).await;
    assert_eq!(rtl.status, Status::Error);

    assert!(s.execute(FlightCommand::ManualOverride { engaged: true }).await.is_ok());
    let res = hold.await.expect("hold task");
    assert_eq!(res.status, Status::Warning, "{}", res.detail);
    assert!(res.detail.contains("manual override"), "{}", res.detail);
    assert_eq!(v.mode(), FlightMode::Loiter);
    assert!(v.is_armed());

    // ledger is free again
    assert!(s.execute(FlightCommand::ManualOverride { engaged: false }).await.is_ok());
    let land = s.execute(FlightCommand::Land { force_here: true, emergency_override: false }).await;
    assert!(land.is_ok(), "{}", land.detail);
    assert!(!v.is_armed());
}

#[tokio::test(start_paused = true)]
async fn stale_heartbeat_brings_the_vehicle_home() {
    let cfg = SimConfig::default();
    let home = cfg.start;
    let v = Arc::new(SimVehicle::new(cfg));
    v.place_airborne(north(home, 30.0), 10.0, FlightMode::Guided);
    let (s, mut rx) = session(&v);
    s.start_watchdogs();

    sleep(Duration::from_secs(5)).await;
    assert!(v.is_armed(), "fresh heartbeat must not trigger anything");

    v.set_heartbeat_age(Duration::from_secs(10));
    assert!(until_disarmed(&v, Duration::from_secs(90)).await);
    assert!(v.position().0.distance_to(&home) < 2.0);

    let mut events = Vec::new();
    drain(&mut rx, &mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, FlightEvent::Failsafe { trigger, .. } if trigger == "connection_loss")));
    assert!(v.commands().contains(&SimCommand::SetMode(FlightMode::Rtl)));
    s.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failsafe_watchdog_returns_on_low_battery() {
    let cfg = SimConfig::default();
    let home = cfg.start;
    let v = Arc::new(SimVehicle::new(cfg));
    v.place_airborne(north(home, 20.0), 10.0, FlightMode::Guided);
    v.set_battery(15.0);
    let (s, mut rx) = session(&v);
    s.start_watchdogs();

    assert!(until_disarmed(&v, Duration::from_secs(90)).await);
    assert!(v.position().0.distance_to(&home) < 2.0);

    let mut events = Vec::new();
    drain(&mut rx, &mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, FlightEvent::Failsafe { trigger, action, .. } if trigger == "low_battery" && action == "rtl")));
}

#[tokio::test(start_paused = true)]
async fn failsafe_does_not_override_operator_landing() {
    let v = Arc::new(SimVehicle::new(SimConfig::default()));
    let (s, mut rx) = session(&v);

    assert!(s.execute(FlightCommand::Arm).await.is_ok());
    s.start_watchdogs();
    let runner = s.clone();
    let hold = tokio::spawn(async move {
        runner.execute(FlightCommand::TimedHold { altitude_m: 25.0, duration_s: 120.0 }).await
    });
    assert!(s.wait_for_state(ManeuverState::Holding, Duration::from_secs(60)).await);
    v.set_battery(22.0);

    let prompt_id = loop {
        if let FlightEvent::EmergencyPrompt { prompt_id, .. } = rx.recv().await.expect("event channel open") {
            break prompt_id;
        }
    };
    let ack = s.execute(FlightCommand::EmergencyResponse { prompt_id, choice: "land".into() }).await;
    assert!(ack.is_ok(), "{}", ack.detail);

    // still descending when the battery crosses the failsafe floor
    sleep(Duration::from_secs(3)).await;
    assert!(v.is_armed());
    v.set_battery(18.0);

    let res = hold.await.expect("hold task");
    assert_eq!(res.status, Status::Warning, "{}", res.detail);
    assert!(res.detail.contains("OperatorLand"), "{}", res.detail);
    sleep(Duration::from_secs(5)).await;

    assert!(!v.is_armed());
    assert!(!v.commands().contains(&SimCommand::SetMode(FlightMode::Rtl)));
    let mut events = Vec::new();
    drain(&mut rx, &mut events);
    assert!(!events.iter().any(|e| matches!(e, FlightEvent::Failsafe { .. })), "{:?}", events);
    s.shutdown();
}

#[tokio::test(start_paused = true)]
async fn gps_loss_during_link_loss_return_keeps_returning() {
    let cfg = SimConfig::default();
    let home = cfg.start;
    let v = Arc::new(SimVehicle::new(cfg));
    v.place_airborne(north(home, 30.0), 10.0, FlightMode::Guided);
    let (s, _rx) = session(&v);
    s.start_watchdogs();

    v.set_heartbeat_age(Duration::from_secs(10));
    let rtl_sent = timeout(Duration::from_secs(30), async {
        while !v.commands().contains(&SimCommand::SetMode(FlightMode::Rtl)) {
            sleep(Duration::from_millis(250)).await;
        }
    })
    .await;
    assert!(rtl_sent.is_ok(), "link loss never started a return");
    v.set_gps(Some(GpsStatus { fix_type: 1, satellites: Some(10), eph: Some(1.0) }));

    assert!(until_disarmed(&v, Duration::from_secs(90)).await);
    assert!(v.position().0.distance_to(&home) < 2.0);

    let cmds = v.commands();
    let rtl_at = cmds
        .iter()
        .position(|c| *c == SimCommand::SetMode(FlightMode::Rtl))
        .expect("RTL command");
    assert!(
        !cmds[rtl_at..].contains(&SimCommand::SetMode(FlightMode::AltHold)),
        "return preempted: {:?}",
        cmds
    );
    s.shutdown();
}

#[tokio::test(start_paused = true)]
async fn refused_post_mission_rtl_falls_back_to_landing() {
    let cfg = SimConfig::default();
    let start = cfg.start;
    let v = Arc::new(SimVehicle::new(cfg));
    v.place_airborne(north(start, 20.0), 10.0, FlightMode::Guided);
    v.refuse_mode(FlightMode::Rtl);
    let (s, mut rx) = session(&v);

    let target = north(start, 30.0);
    let res = s
        .execute(FlightCommand::WaypointMission {
            waypoints: vec![WaypointInput { lat: target.lat, lon: target.lon, alt: Some(10.0) }],
            takeoff_altitude_m: None,
            post_mission_action: Some(PostMissionAction::Rtl),
        })
        .await;

    assert_eq!(res.status, Status::Warning, "{}", res.detail);
    assert!(res.detail.contains("post-mission RTL failed"), "{}", res.detail);
    let report = res.payload.as_ref().expect("mission report");
    assert_eq!(report["status"], "aborted");
    assert_eq!(report["end"]["end"], "post_action_failed");
    assert_eq!(report["completed_waypoints"], 1);

    assert!(!v.is_armed());
    assert!(v.position().0.distance_to(&target) < 3.0);
    let cmds = v.commands();
    assert!(cmds.contains(&SimCommand::SetMode(FlightMode::Rtl)));
    assert!(cmds.contains(&SimCommand::SetMode(FlightMode::Land)));

    let mut events = Vec::new();
    drain(&mut rx, &mut events);
    assert!(events.iter().any(|e| matches!(e, FlightEvent::WaypointReached { waypoint: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, FlightEvent::MissionAborted { completed_waypoints: 1, .. })));
    assert!(!events.iter().any(|e| matches!(e, FlightEvent::MissionComplete { .. })));

    let status = s.execute(FlightCommand::MissionStatus).await;
    assert!(status.detail.ends_with("Aborted: 1/1"), "{}", status.detail);
}
