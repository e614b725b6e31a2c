use std::time::Duration;

use thiserror::Error;

/// Gameplay and policy knobs for a single duel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DuelRules {
    pub max_rounds: u32,
    pub damage_threshold: u32,
    pub base_damage: u32,
    pub ready_window: Duration,
    pub turn_timeout: Duration,
    pub reconnect_grace: Duration,
    /// Largest wager as basis points of the challenger's balance.
    pub max_wager_bps: u32,
    pub max_level_gap: u32,
    pub min_wager: u64,
}

impl Default for DuelRules {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            damage_threshold: 100,
            base_damage: 10,
            ready_window: Duration::from_secs(30),
            turn_timeout: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(20),
            max_wager_bps: 5_000,
            max_level_gap: 10,
            min_wager: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub rules: DuelRules,
    pub challenge_ttl: Duration,
    /// Upper bound on compare-and-swap retries before a transition reports contention.
    pub cas_max_attempts: u32,
    pub challenge_sweep_interval: Duration,
    pub reconciliation_interval: Duration,
    pub cache_ttl_slack: Duration,
    /// Age after which a `pending` duel record is considered abandoned.
    pub stale_pending_after: Duration,
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rules: DuelRules::default(),
            challenge_ttl: Duration::from_secs(5 * 60),
            cas_max_attempts: 8,
            challenge_sweep_interval: Duration::from_secs(15),
            reconciliation_interval: Duration::from_secs(30),
            cache_ttl_slack: Duration::from_secs(60),
            stale_pending_after: Duration::from_secs(60),
            rng_seed: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid engine config: {0}")]
pub struct ConfigError(pub &'static str);

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rules = &self.rules;
        if rules.max_rounds == 0 {
            return Err(ConfigError("max_rounds must be at least 1"));
        }
        if rules.damage_threshold == 0 || rules.base_damage == 0 {
            return Err(ConfigError("damage_threshold and base_damage must be positive"));
        }
        if rules.ready_window.is_zero()
            || rules.turn_timeout.is_zero()
            || rules.reconnect_grace.is_zero()
        {
            return Err(ConfigError("timeouts must be non-zero"));
        }
        if rules.max_wager_bps == 0 || rules.max_wager_bps > 10_000 {
            return Err(ConfigError("max_wager_bps must be within 1..=10000"));
        }
        if rules.min_wager == 0 {
            return Err(ConfigError("min_wager must be positive"));
        }
        if self.cas_max_attempts == 0 {
            return Err(ConfigError("cas_max_attempts must be at least 1"));
        }
        if self.challenge_ttl.is_zero() {
            return Err(ConfigError("challenge_ttl must be non-zero"));
        }
        Ok(())
    }

    /// Cache lifetime of a live duel: the longest a duel can run plus grace and slack.
    pub fn live_state_ttl(&self) -> Duration {
        let rules = &self.rules;
        rules.ready_window
            + rules.turn_timeout * 2 * rules.max_rounds
            + rules.reconnect_grace
            + self.cache_ttl_slack
    }
}
