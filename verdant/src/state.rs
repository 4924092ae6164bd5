use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use std::collections::HashMap;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};
use tokio::sync::{Mutex, RwLock};

/// Named scalar measurement streams. The unit of a reading is implied
/// by its channel.
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    /// Degrees celsius, from the Pi host.
    Temperature,
    /// Lux, from the Pi host.
    Light,
    /// Parts per million, from the microcontroller.
    Co2,
    /// Relative humidity percent, from the microcontroller.
    Humidity,
    /// Soil moisture percent, from the microcontroller.
    SoilMoisture,
}

/// A single scalar measurement. `observed_at` is the local receipt
/// time, producers are not assumed to share a clock.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Reading {
    channel: Channel,
    value: f64,
    observed_at: DateTime<Utc>,
}

impl Reading {
    pub fn new(channel: Channel, value: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            channel,
            value,
            observed_at,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Point in time view of the latest reading per channel. Channels that
/// were never observed are absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FusedState {
    readings: HashMap<Channel, Reading>,
}

impl FusedState {
    /// Latest reading for a channel regardless of age.
    pub fn latest(&self, channel: Channel) -> Option<&Reading> {
        self.readings.get(&channel)
    }

    /// Latest reading for a channel, treating readings older than
    /// `max_age` as absent. With no `max_age` readings never expire.
    pub fn fresh(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
    ) -> Option<&Reading> {
        let reading = self.readings.get(&channel)?;
        match max_age {
            Some(max_age) if now - reading.observed_at > max_age => None,
            _ => Some(reading),
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    fn apply(&mut self, reading: Reading) {
        self.readings.insert(reading.channel, reading);
    }
}

/// Binary output of the relay.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum Actuation {
    Engaged,
    #[default]
    Disengaged,
}

/// The relay state as last decided by the controller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ActuatorState {
    pub actuation: Actuation,
    /// `None` until the first transition.
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// A committed change of actuator state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: ActuatorState,
    pub to: Actuation,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// Only a move into `Engaged` raises the alert.
    pub fn raises_alert(&self) -> bool {
        self.from.actuation == Actuation::Disengaged && self.to == Actuation::Engaged
    }
}

/// Process wide owner of the fused sensor view and the actuator state.
/// All mutation goes through single channel updates or a compare and
/// set on the actuator state, readers always receive an owned copy.
#[derive(Debug, Default)]
pub struct StateStore {
    fused: RwLock<FusedState>,
    actuator: Mutex<ActuatorState>,
}

assert_impl_all!(StateStore: Send, Sync);

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored reading for exactly one channel.
    pub async fn update(&self, reading: Reading) {
        self.fused.write().await.apply(reading);
    }

    /// Commit a group of readings taken from one message as a single
    /// write, so a snapshot never sees half of a group.
    pub async fn update_group<I>(&self, readings: I)
    where
        I: IntoIterator<Item = Reading>,
    {
        let mut guard = self.fused.write().await;
        for reading in readings {
            guard.apply(reading);
        }
    }

    /// Owned copy of every channel as of the call.
    pub async fn snapshot(&self) -> FusedState {
        self.fused.read().await.clone()
    }

    pub async fn actuator(&self) -> ActuatorState {
        *self.actuator.lock().await
    }

    /// Record `desired` as the actuator state if it differs from the
    /// current one. Returns the transition, or `None` when the decision
    /// repeats the current state.
    pub async fn commit_actuation(
        &self,
        desired: Actuation,
        at: DateTime<Utc>,
    ) -> Option<Transition> {
        let mut guard = self.actuator.lock().await;
        if guard.actuation == desired {
            return None;
        }
        let from = *guard;
        *guard = ActuatorState {
            actuation: desired,
            last_transition_at: Some(at),
        };
        Some(Transition {
            from,
            to: desired,
            at,
        })
    }

    /// Undo a committed transition, used when the hardware write failed
    /// and the next evaluation should attempt it again.
    pub async fn revert_actuation(&self, transition: &Transition) {
        let mut guard = self.actuator.lock().await;
        if guard.actuation == transition.to {
            *guard = transition.from;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use strum::IntoEnumIterator;

    fn reading(channel: Channel, value: f64) -> Reading {
        Reading::new(channel, value, Utc::now())
    }

    #[tokio::test]
    async fn test_snapshot_reflects_latest_write_per_channel() {
        let store = StateStore::new();
        store.update(reading(Channel::Temperature, 20.0)).await;
        store.update(reading(Channel::Co2, 500.0)).await;
        store.update(reading(Channel::Temperature, 24.5)).await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.latest(Channel::Temperature).unwrap().value(), 24.5);
        assert_eq!(snapshot.latest(Channel::Co2).unwrap().value(), 500.0);
        assert!(snapshot.latest(Channel::Humidity).is_none());
        assert!(snapshot.latest(Channel::Light).is_none());
        assert!(snapshot.latest(Channel::SoilMoisture).is_none());
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_update_leaves_other_channels_untouched() {
        let store = StateStore::new();
        store
            .update_group(vec![
                reading(Channel::Co2, 450.0),
                reading(Channel::Humidity, 60.0),
                reading(Channel::SoilMoisture, 33.0),
            ])
            .await;
        store.update(reading(Channel::Humidity, 65.0)).await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.latest(Channel::Co2).unwrap().value(), 450.0);
        assert_eq!(snapshot.latest(Channel::Humidity).unwrap().value(), 65.0);
        assert_eq!(snapshot.latest(Channel::SoilMoisture).unwrap().value(), 33.0);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_later_writes() {
        let store = StateStore::new();
        store.update(reading(Channel::Light, 100.0)).await;
        let before = store.snapshot().await;
        store.update(reading(Channel::Light, 900.0)).await;
        assert_eq!(before.latest(Channel::Light).unwrap().value(), 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// Every writer stores the same value in all channels of its group, so a
    /// torn snapshot would show a group with mixed values.
    async fn test_concurrent_updates_never_tear_snapshot() {
        let store = Arc::new(StateStore::new());
        let mut handles = Vec::new();

        for writer in 0..4u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..200u32 {
                    let value = f64::from(writer * 1000 + i);
                    store
                        .update_group(vec![
                            reading(Channel::Co2, value),
                            reading(Channel::Humidity, value),
                            reading(Channel::SoilMoisture, value),
                        ])
                        .await;
                    store.update(reading(Channel::Temperature, value)).await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        let reader_store = store.clone();
        let reader = tokio::spawn(async move {
            for _ in 0..500 {
                let snapshot = reader_store.snapshot().await;
                let group: Vec<_> = [Channel::Co2, Channel::Humidity, Channel::SoilMoisture]
                    .iter()
                    .map(|c| snapshot.latest(*c).map(Reading::value))
                    .collect();
                assert!(
                    group.windows(2).all(|w| w[0] == w[1]),
                    "Torn group in snapshot {group:?}"
                );
                tokio::task::yield_now().await;
            }
        });

        for handle in handles {
            handle.await.expect("Writer panicked");
        }
        reader.await.expect("Reader panicked");

        let snapshot = store.snapshot().await;
        for channel in [Channel::Co2, Channel::Humidity, Channel::SoilMoisture, Channel::Temperature] {
            let value = snapshot.latest(channel).unwrap().value();
            assert_eq!(value % 1000.0, 199.0, "Last write lost for {channel}");
        }
    }

    #[tokio::test]
    async fn test_commit_actuation_is_idempotent() {
        let store = StateStore::new();
        let now = Utc::now();

        let first = store.commit_actuation(Actuation::Engaged, now).await;
        let second = store.commit_actuation(Actuation::Engaged, now).await;

        let first = first.expect("First decision should transition");
        assert!(first.raises_alert());
        assert!(second.is_none());
        assert_eq!(store.actuator().await.last_transition_at, Some(now));
    }

    #[tokio::test]
    async fn test_revert_actuation_restores_previous_state() {
        let store = StateStore::new();
        let transition = store
            .commit_actuation(Actuation::Engaged, Utc::now())
            .await
            .unwrap();
        store.revert_actuation(&transition).await;
        assert_eq!(store.actuator().await, ActuatorState::default());
    }

    #[rstest]
    #[case(None, true)]
    #[case(Some(Duration::seconds(60)), true)]
    #[case(Some(Duration::seconds(5)), false)]
    fn test_fresh_respects_max_age(#[case] max_age: Option<Duration>, #[case] present: bool) {
        let now = Utc::now();
        let mut state = FusedState::default();
        state.apply(Reading::new(Channel::Co2, 700.0, now - Duration::seconds(30)));
        assert_eq!(state.fresh(Channel::Co2, now, max_age).is_some(), present);
    }

    #[rstest]
    #[case("temperature", Channel::Temperature)]
    #[case("co2", Channel::Co2)]
    #[case("soil_moisture", Channel::SoilMoisture)]
    fn test_channel_names(#[case] name: &str, #[case] channel: Channel) {
        assert_eq!(name.parse::<Channel>().unwrap(), channel);
        assert_eq!(channel.to_string(), name);
        assert!(Channel::iter().any(|c| c == channel));
    }
}
