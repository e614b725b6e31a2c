//! Helpers shared by the unit test modules.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::DuelRules;
use crate::engine::duel::{LiveDuelState, PlayerId};

pub mod serde {
    use std::fmt::Debug;

    /// Assert that a value survives a serde_json round-trip using structural equality.
    pub fn assert_round_trip_eq<T>(value: &T)
    where
        T: ::serde::Serialize + ::serde::de::DeserializeOwned + PartialEq + Debug,
    {
        let json = serde_json::to_string(value)
            .expect("serialization should succeed during round-trip testing");
        let restored: T = serde_json::from_str(&json)
            .expect("deserialization should succeed during round-trip testing");
        assert_eq!(restored, *value, "serde_json round-trip altered the value");
    }
}

/// Fresh live state in `awaiting_ready` for two players and a wager of 100.
pub fn live_state(a: PlayerId, b: PlayerId, now: DateTime<Utc>) -> LiveDuelState {
    LiveDuelState::new(Uuid::new_v4(), 100, a, b, &DuelRules::default(), now)
}
