use crate::{
    devices::hardware::output_line::OutputDevice,
    error::ConfigError,
    state::{Actuation, Channel, FusedState, StateStore, Transition},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Inclusive safe range for a channel. A value strictly outside the
/// range votes for the relay to engage.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq)]
pub struct Band {
    pub low: f64,
    pub high: f64,
}

impl Band {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.low <= value && value <= self.high
    }

    /// Reject bands that can never be satisfied.
    pub fn validate(&self, channel: Channel) -> Result<(), ConfigError> {
        if self.low.is_finite() && self.high.is_finite() && self.low <= self.high {
            Ok(())
        } else {
            Err(ConfigError::InvalidBand {
                channel: channel.to_string(),
                low: self.low,
                high: self.high,
            })
        }
    }
}

/// What to do with the recorded actuator state when the relay write fails.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailurePolicy {
    /// Keep the intended state. An unchanged decision will not rewrite
    /// the line, and no alert is raised for the failed write.
    #[default]
    Commit,
    /// Restore the previous state so the next evaluation writes again.
    Retry,
}

/// Per channel votes derived from a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Safe,
    Unsafe,
}

/// Dual threshold policy over the monitored channels.
#[derive(Clone, Debug, PartialEq)]
pub struct HysteresisPolicy {
    bands: HashMap<Channel, Band>,
    max_reading_age: Option<Duration>,
}

impl HysteresisPolicy {
    /// * `bands`: safe range for every monitored channel.
    /// * `max_reading_age`: readings older than this stop voting. `None`
    ///   keeps readings valid forever.
    pub fn new(bands: HashMap<Channel, Band>, max_reading_age: Option<Duration>) -> Self {
        Self {
            bands,
            max_reading_age,
        }
    }

    /// Votes of every monitored channel with a usable reading. Absent or
    /// expired channels do not vote.
    pub fn votes(&self, state: &FusedState, now: DateTime<Utc>) -> Vec<(Channel, Vote)> {
        let mut votes: Vec<_> = self
            .bands
            .iter()
            .filter_map(|(channel, band)| {
                let reading = state.fresh(*channel, now, self.max_reading_age)?;
                let vote = if band.contains(reading.value()) {
                    Vote::Safe
                } else {
                    Vote::Unsafe
                };
                Some((*channel, vote))
            })
            .collect();
        votes.sort_by_key(|(channel, _)| *channel);
        votes
    }

    /// Engage if any channel votes unsafe, otherwise disengage.
    pub fn decide(&self, state: &FusedState, now: DateTime<Utc>) -> Actuation {
        if self
            .votes(state, now)
            .iter()
            .any(|(_, vote)| *vote == Vote::Unsafe)
        {
            Actuation::Engaged
        } else {
            Actuation::Disengaged
        }
    }
}

/// Decides the relay state after every accepted reading and is the only
/// writer of the relay and alert lines.
pub struct HysteresisController {
    uuid: Uuid,
    policy: HysteresisPolicy,
    store: Arc<StateStore>,
    relay: Mutex<OutputDevice>,
    alert: Arc<Mutex<OutputDevice>>,
    alert_pulse: std::time::Duration,
    on_write_failure: WriteFailurePolicy,
    /// Incremented by each pulse so an older pulse does not end a newer one.
    pulse_generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl HysteresisController {
    /// * `store`: shared state the controller reads snapshots from and
    ///   records actuator transitions into.
    /// * `relay`: line driven while engaged.
    /// * `alert`: line pulsed on each transition into engaged.
    pub fn new(
        policy: HysteresisPolicy,
        store: Arc<StateStore>,
        relay: OutputDevice,
        alert: OutputDevice,
        alert_pulse: std::time::Duration,
        on_write_failure: WriteFailurePolicy,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            policy,
            store,
            relay: Mutex::new(relay),
            alert: Arc::new(Mutex::new(alert)),
            alert_pulse,
            on_write_failure,
            pulse_generation: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn get_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn policy(&self) -> &HysteresisPolicy {
        &self.policy
    }

    /// Re-evaluate the relay against a fresh snapshot. The line is only
    /// written when the decision differs from the recorded state. Returns
    /// the committed transition, if any.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Option<Transition> {
        // Holding the relay for the whole evaluation keeps line writes in
        // decision order.
        let mut relay = self.relay.lock().await;
        if self.shutdown.is_cancelled() {
            return None;
        }

        let snapshot = self.store.snapshot().await;
        let desired = self.policy.decide(&snapshot, now);
        let transition = self.store.commit_actuation(desired, now).await?;

        let written = match relay.set_active(desired == Actuation::Engaged) {
            Ok(()) => {
                tracing::info!(
                    controller = %self.uuid,
                    from = %transition.from.actuation,
                    to = %desired,
                    votes = ?self.policy.votes(&snapshot, now),
                    "Relay transition"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    controller = %self.uuid,
                    to = %desired,
                    error = %e,
                    policy = ?self.on_write_failure,
                    "Relay write failed"
                );
                if self.on_write_failure == WriteFailurePolicy::Retry {
                    self.store.revert_actuation(&transition).await;
                    return None;
                }
                false
            }
        };

        // The alert reports the relay engaging, not the decision alone.
        if written && transition.raises_alert() {
            self.pulse_alert();
        }
        Some(transition)
    }

    /// Fire and forget alert pulse. Returns immediately, the line is
    /// released after `alert_pulse` or on shutdown.
    fn pulse_alert(&self) {
        let alert = self.alert.clone();
        let shutdown = self.shutdown.clone();
        let duration = self.alert_pulse;
        let generation = self.pulse_generation.clone();
        let pulse = generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            {
                let mut line = alert.lock().await;
                if shutdown.is_cancelled() {
                    return;
                }
                if let Err(e) = line.activate() {
                    tracing::error!(line = line.label(), error = %e, "Alert pulse failed");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = shutdown.cancelled() => {}
            }

            let mut line = alert.lock().await;
            if generation.load(Ordering::SeqCst) == pulse || shutdown.is_cancelled() {
                if let Err(e) = line.deactivate() {
                    tracing::error!(line = line.label(), error = %e, "Failed to end alert pulse");
                }
            }
        });
    }

    /// Drive both lines inactive and stop any further writes. Does not
    /// wait for a decision or a pulse to complete.
    pub async fn safe_off(&self) {
        self.shutdown.cancel();

        let mut relay = self.relay.lock().await;
        if let Err(e) = relay.deactivate() {
            tracing::error!(line = relay.label(), error = %e, "Failed to release relay");
        }
        drop(relay);

        let mut alert = self.alert.lock().await;
        if let Err(e) = alert.deactivate() {
            tracing::error!(line = alert.label(), error = %e, "Failed to release alert");
        }
        tracing::info!(controller = %self.uuid, "Outputs driven to safe off");
    }
}
