//! Room server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RoomTemplate;

// ---------------------------------------------------------------------------
// RoomServerConfig
// ---------------------------------------------------------------------------

/// Tunables for the room server task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomServerConfig {
    /// Capacity of the command channel between handles and the server.
    pub command_buffer: usize,

    /// Timer retries a parked join gets before failing with `Timeout`.
    pub join_retry_limit: u32,

    /// Delay between timer retries of a parked join.
    pub join_retry_interval: Duration,

    /// Upper bound for the page size of room queries.
    pub max_page_size: usize,

    /// Seed for the room id generator. `None` seeds from the OS.
    pub id_seed: Option<u64>,

    pub matchmaking: MatchmakingConfig,
}

impl Default for RoomServerConfig {
    fn default() -> Self {
        Self {
            command_buffer: 64,
            join_retry_limit: 5,
            join_retry_interval: Duration::from_secs(1),
            max_page_size: 100,
            id_seed: None,
            matchmaking: MatchmakingConfig::default(),
        }
    }
}

impl RoomServerConfig {
    /// Returns a copy with out-of-range values replaced by usable ones.
    pub fn validated(mut self) -> Self {
        if self.command_buffer == 0 {
            tracing::warn!("command_buffer of 0 is not allowed, using 1");
            self.command_buffer = 1;
        }
        if self.join_retry_limit == 0 {
            tracing::warn!("join_retry_limit of 0 is not allowed, using 1");
            self.join_retry_limit = 1;
        }
        if self.join_retry_interval.is_zero() {
            tracing::warn!("join_retry_interval of 0 is not allowed, using 10ms");
            self.join_retry_interval = Duration::from_millis(10);
        }
        if self.max_page_size == 0 {
            tracing::warn!("max_page_size of 0 is not allowed, using 1");
            self.max_page_size = 1;
        }
        self.matchmaking = self.matchmaking.validated();
        self
    }
}

// ---------------------------------------------------------------------------
// MatchmakingConfig
// ---------------------------------------------------------------------------

/// Tunables for the matchmaking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingConfig {
    /// How often pending requests are re-examined.
    pub tick_interval: Duration,

    /// Unplaced requests older than this are dropped.
    pub request_timeout: Duration,

    /// Blueprint for rooms created when no open room fits a request.
    pub room_template: RoomTemplate,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
            room_template: RoomTemplate::default(),
        }
    }
}

impl MatchmakingConfig {
    pub fn validated(mut self) -> Self {
        if self.tick_interval.is_zero() {
            tracing::warn!("matchmaking tick_interval of 0 is not allowed, using 100ms");
            self.tick_interval = Duration::from_millis(100);
        }
        let template = &mut self.room_template;
        if template.max_players == 0 {
            tracing::warn!(category = %template.category, "match template max_players of 0, using 1");
            template.max_players = 1;
        }
        if template.min_players > template.max_players {
            tracing::warn!(
                category = %template.category,
                min = template.min_players,
                max = template.max_players,
                "match template min_players above max_players, clamping"
            );
            template.min_players = template.max_players;
        }
        self
    }
}
