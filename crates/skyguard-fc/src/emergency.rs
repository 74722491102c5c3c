//! Operator negotiation for battery emergencies.
//!
//! When the battery crosses the critical threshold mid-flight the engine
//! does not pick a maneuver on its own. It publishes a prompt with a
//! recommendation, waits for the operator to answer LAND or RTL, and falls
//! back to RTL when nobody answers in time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyguard_proto::{EmergencyChoice, EmergencyResolution, FlightEvent};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::events::EventSink;
use crate::lock;
use crate::state::VehicleSnapshot;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NegotiationPolicy {
    pub response_timeout_s: f64,
    /// How long an answered prompt stays around to reject duplicate answers.
    pub grace_s: f64,
    pub countdown_interval_s: f64,

    pub close_to_home_m: f64,
    pub far_from_home_m: f64,
    pub far_battery_percent: u8,
    pub high_altitude_m: f64,
    pub high_altitude_battery_percent: u8,
    /// Below this fix type navigation home is not trusted.
    pub reliable_gps_fix: u8,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            response_timeout_s: 10.0,
            grace_s: 2.0,
            countdown_interval_s: 1.0,
            close_to_home_m: 10.0,
            far_from_home_m: 100.0,
            far_battery_percent: 20,
            high_altitude_m: 50.0,
            high_altitude_battery_percent: 15,
            reliable_gps_fix: 3,
        }
    }
}

impl NegotiationPolicy {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.response_timeout_s)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.response_timeout_s > 0.0, "emergency.response_timeout_s must be positive");
        anyhow::ensure!(self.countdown_interval_s > 0.0, "emergency.countdown_interval_s must be positive");
        anyhow::ensure!(self.grace_s >= 0.0, "emergency.grace_s must not be negative");
        anyhow::ensure!(self.close_to_home_m < self.far_from_home_m, "emergency.close_to_home_m must be below far_from_home_m");
        Ok(())
    }

    /// Ordered rules; a later matching rule overrides an earlier one.
    pub fn recommend(&self, ctx: &EmergencyContext) -> Recommendation {
        let mut rec = Recommendation { choice: EmergencyChoice::Rtl, reason: "Safe return to launch point".to_string() };
        let battery = ctx.battery_percent.unwrap_or(0);

        if let Some(d) = ctx.distance_to_home_m {
            if d < self.close_to_home_m {
                rec = Recommendation::land(format!("Close to home ({:.0}m), landing here is safe", d));
            } else if d > self.far_from_home_m && battery < self.far_battery_percent {
                rec = Recommendation::land(format!(
                    "Far from home ({:.0}m) with critical battery, immediate landing is safer",
                    d
                ));
            }
        }
        if let Some(alt) = ctx.altitude_m {
            if alt > self.high_altitude_m && battery < self.high_altitude_battery_percent {
                rec = Recommendation::land(format!("High altitude ({:.0}m) with very low battery, descend now", alt));
            }
        }
        if ctx.gps_fix.unwrap_or(0) < self.reliable_gps_fix {
            rec = Recommendation::land("Poor GPS fix, landing now is safer than navigating home".to_string());
        }
        rec
    }
}

/// Telemetry frozen at the moment the emergency was declared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyContext {
    pub battery_percent: Option<u8>,
    pub distance_to_home_m: Option<f64>,
    pub altitude_m: Option<f64>,
    pub gps_fix: Option<u8>,
}

impl EmergencyContext {
    pub fn from_snapshot(snap: &VehicleSnapshot) -> Self {
        Self {
            battery_percent: snap.battery_percent(),
            distance_to_home_m: snap.distance_to_home(),
            altitude_m: snap.altitude(),
            gps_fix: snap.gps_fix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub choice: EmergencyChoice,
    pub reason: String,
}

impl Recommendation {
    fn land(reason: String) -> Self {
        Self { choice: EmergencyChoice::Land, reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("no emergency prompt with id {0}")]
    UnknownPrompt(String),
    #[error("prompt {0} was already answered")]
    AlreadyResolved(String),
    #[error("invalid choice '{0}', expected LAND or RTL")]
    InvalidChoice(String),
}

#[derive(Debug)]
struct PromptSlot {
    responder: Option<oneshot::Sender<EmergencyChoice>>,
    resolved_at: Option<Instant>,
}

/// Open and recently closed prompts, keyed by id.
#[derive(Debug)]
pub struct PromptRegistry {
    slots: Mutex<HashMap<String, PromptSlot>>,
    grace: Duration,
}

impl PromptRegistry {
    pub fn new(grace: Duration) -> Self {
        Self { slots: Mutex::new(HashMap::new()), grace }
    }

    fn open(&self, id: &str) -> oneshot::Receiver<EmergencyChoice> {
        let (tx, rx) = oneshot::channel();
        let mut slots = lock(&self.slots);
        self.purge(&mut slots);
        slots.insert(id.to_string(), PromptSlot { responder: Some(tx), resolved_at: None });
        rx
    }

    /// Operator answer. Unknown ids are checked first, then the choice,
    /// then whether the prompt is still open.
    pub fn respond(&self, id: &str, choice: &str) -> Result<EmergencyChoice, ResponseError> {
        let mut slots = lock(&self.slots);
        self.purge(&mut slots);
        let slot = slots.get_mut(id).ok_or_else(|| ResponseError::UnknownPrompt(id.to_string()))?;
        let choice: EmergencyChoice = choice.parse().map_err(ResponseError::InvalidChoice)?;
        let tx = slot.responder.take().ok_or_else(|| ResponseError::AlreadyResolved(id.to_string()))?;
        slot.resolved_at = Some(Instant::now());
        if tx.send(choice).is_err() {
            // negotiation already gave up on this prompt
            return Err(ResponseError::AlreadyResolved(id.to_string()));
        }
        info!(event = "emergency_response", prompt_id = id, choice = %choice);
        Ok(choice)
    }

    fn close(&self, id: &str) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(id) {
            slot.responder = None;
            slot.resolved_at.get_or_insert_with(Instant::now);
        }
    }

    /// Ids still waiting for an answer.
    pub fn pending(&self) -> Vec<String> {
        let slots = lock(&self.slots);
        slots.iter().filter(|(_, s)| s.responder.is_some()).map(|(id, _)| id.clone()).collect()
    }

    fn purge(&self, slots: &mut HashMap<String, PromptSlot>) {
        let grace = self.grace;
        slots.retain(|_, s| s.resolved_at.map_or(true, |t| t.elapsed() <= grace));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Negotiation {
    pub prompt_id: String,
    pub context: EmergencyContext,
    pub recommendation: Recommendation,
    pub resolution: EmergencyResolution,
}

pub struct EmergencyDesk {
    policy: NegotiationPolicy,
    registry: PromptRegistry,
    sink: Arc<dyn EventSink>,
    seq: AtomicU64,
}

impl EmergencyDesk {
    pub fn new(policy: NegotiationPolicy, sink: Arc<dyn EventSink>) -> Self {
        let registry = PromptRegistry::new(Duration::from_secs_f64(policy.grace_s));
        Self { policy, registry, sink, seq: AtomicU64::new(0) }
    }

    pub fn policy(&self) -> &NegotiationPolicy {
        &self.policy
    }

    pub fn respond(&self, prompt_id: &str, choice: &str) -> Result<EmergencyChoice, ResponseError> {
        self.registry.respond(prompt_id, choice)
    }

    pub fn pending(&self) -> Vec<String> {
        self.registry.pending()
    }

    fn next_prompt_id(&self) -> String {
        let ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        if n == 0 {
            format!("battery_emergency_{}", ms)
        } else {
            format!("battery_emergency_{}_{}", ms, n)
        }
    }

    /// Publish a prompt and wait for the operator or the deadline.
    pub async fn negotiate(&self, context: EmergencyContext) -> Negotiation {
        let prompt_id = self.next_prompt_id();
        let recommendation = self.policy.recommend(&context);
        let timeout = self.policy.response_timeout();
        let mut rx = self.registry.open(&prompt_id);

        warn!(
            event = "emergency_prompt",
            prompt_id = %prompt_id,
            battery = ?context.battery_percent,
            distance_to_home_m = ?context.distance_to_home_m,
            altitude_m = ?context.altitude_m,
            gps_fix = ?context.gps_fix,
            recommendation = %recommendation.choice,
            reason = %recommendation.reason,
        );
        self.sink.publish(FlightEvent::EmergencyPrompt {
            prompt_id: prompt_id.clone(),
            battery_percent: context.battery_percent,
            distance_to_home_m: context.distance_to_home_m,
            altitude_m: context.altitude_m,
            gps_fix: context.gps_fix,
            recommendation: recommendation.choice,
            reason: recommendation.reason.clone(),
            options: vec![EmergencyChoice::Land, EmergencyChoice::Rtl],
            timeout_s: timeout.as_secs_f64(),
        });

        let start = Instant::now();
        let deadline = start + timeout;
        let step = Duration::from_secs_f64(self.policy.countdown_interval_s);
        let mut ticks = interval_at(start + step, step);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        let answer = loop {
            tokio::select! {
                biased;
                res = &mut rx => break res.ok(),
                _ = &mut expiry => break None,
                _ = ticks.tick() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let remaining_s = remaining.as_secs_f64().ceil() as u64;
                    if remaining_s > 0 {
                        self.sink.publish(FlightEvent::EmergencyCountdown { prompt_id: prompt_id.clone(), remaining_s });
                    }
                }
            }
        };
        self.registry.close(&prompt_id);

        let resolution = match answer {
            Some(EmergencyChoice::Land) => EmergencyResolution::OperatorLand,
            Some(EmergencyChoice::Rtl) => EmergencyResolution::OperatorRtl,
            None => {
                warn!(event = "emergency_timeout", prompt_id = %prompt_id, timeout_s = timeout.as_secs_f64());
                EmergencyResolution::TimeoutRtl
            }
        };
        info!(event = "emergency_resolved", prompt_id = %prompt_id, resolution = ?resolution);
        Negotiation { prompt_id, context, recommendation, resolution }
    }
}
