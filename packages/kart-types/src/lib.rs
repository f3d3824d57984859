//! # kart-types
//!
//! Shared data model for the kart championship race-day tooling.
//!
//! These types are used by:
//! - `raceday-server`: draw engine, result ledger, timing-sheet import
//! - the championship REST API: every struct here serializes to the camelCase
//!   JSON the backend stores per stage
//!
//! ## Conventions
//!
//! - Kart *indexes* are 0-based (`Fleet::inactive_karts`), kart *numbers* are
//!   1-based (what is painted on the kart and printed on timing sheets).
//! - Battery indexes are 0-based positions in a category's stage schedule.
//! - Time values travel as strings (`M:SS.sss`, `SS.sss`, `H:MM:SS.sss`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type StageId = String;
pub type CategoryId = String;
pub type PilotId = String;
pub type FleetId = String;
pub type BatteryIndex = usize;
pub type KartNumber = u32;

/// `category → pilot → battery → kart`
pub type DrawTree = BTreeMap<CategoryId, BTreeMap<PilotId, BTreeMap<BatteryIndex, KartSlot>>>;

/// `category → pilot → battery → result entry`
pub type ResultTree =
    BTreeMap<CategoryId, BTreeMap<PilotId, BTreeMap<BatteryIndex, StageResultEntry>>>;

// ── Fleet ─────────────────────────────────────────────────────────────────────

/// Venue preset used to seed a stage fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub name: String,
    pub default_kart_count: u32,
}

/// Named pool of numbered karts available at a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fleet {
    pub id: FleetId,
    pub name: String,
    pub total_karts: u32,
    /// 0-based kart indexes taken out of the draw
    #[serde(default)]
    pub inactive_karts: BTreeSet<u32>,
}

impl Fleet {
    pub fn new(id: impl Into<FleetId>, name: impl Into<String>, total_karts: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            total_karts,
            inactive_karts: BTreeSet::new(),
        }
    }

    pub fn from_track(id: impl Into<FleetId>, track: &Track) -> Self {
        Self::new(id, format!("{} fleet", track.name), track.default_kart_count)
    }

    pub fn is_active(&self, index: u32) -> bool {
        index < self.total_karts && !self.inactive_karts.contains(&index)
    }

    /// Active karts, counting only inactive indexes inside the fleet range.
    pub fn active_count(&self) -> u32 {
        let inactive = self.inactive_karts.range(..self.total_karts).count() as u32;
        self.total_karts - inactive
    }

    /// Kart numbers (1-based) available to the draw, ascending.
    pub fn active_karts(&self) -> Vec<KartNumber> {
        (0..self.total_karts)
            .filter(|&i| self.is_active(i))
            .map(|i| i + 1)
            .collect()
    }

    pub fn contains_kart(&self, kart: KartNumber) -> bool {
        kart >= 1 && kart <= self.total_karts
    }
}

// ── Categories & pilots ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pilot {
    pub id: PilotId,
    pub name: String,
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRoster {
    pub id: CategoryId,
    pub name: String,
    /// Number of batteries (heats) this category runs at the stage
    pub battery_count: usize,
    #[serde(default)]
    pub pilots: Vec<Pilot>,
}

impl CategoryRoster {
    pub fn confirmed_pilots(&self) -> impl Iterator<Item = &Pilot> {
        self.pilots.iter().filter(|p| p.confirmed)
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed_pilots().count()
    }
}

// ── Draw & results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KartSlot {
    pub kart: KartNumber,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StageResultEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_lap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifying_best_lap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_laps: Option<u32>,
    /// `Some(false)` = below minimum weight; absent or `true` = compliant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<bool>,
    /// Seconds of time penalty already folded into `total_time`, for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_time: Option<String>,
}

impl StageResultEntry {
    pub fn is_below_weight(&self) -> bool {
        self.weight == Some(false)
    }
}

/// Body of `PATCH /stages/{id}/kart-draw`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KartDrawPayload {
    pub results: DrawTree,
    pub category_fleet_assignments: BTreeMap<CategoryId, FleetId>,
}

// ── Penalties ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyType {
    TimePenalty,
    PositionPenalty,
    Disqualification,
    Warning,
    Suspension,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyStatus {
    #[default]
    Pending,
    Applied,
    Cancelled,
    Appealed,
}

/// Penalty as created on the backend (`POST /penalties` body).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewPenalty {
    #[serde(rename = "type")]
    pub penalty_type: PenaltyType,
    #[serde(default)]
    pub status: PenaltyStatus,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_penalty_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_penalty: Option<u32>,
    pub user_id: PilotId,
    pub stage_id: StageId,
    pub category_id: CategoryId,
    pub battery_index: BatteryIndex,
    #[serde(default)]
    pub is_imported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Penalty {
    pub id: String,
    #[serde(flatten)]
    pub details: NewPenalty,
}

impl Penalty {
    /// Import duplicate key.
    pub fn matches(&self, user_id: &str, reason: &str) -> bool {
        self.details.user_id == user_id && self.details.reason == reason
    }
}

// ── Schedule & lap times ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleItem {
    pub id: String,
    pub label: String,
    /// Wall-clock start, `HH:MM`
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LapTime {
    pub lap: u32,
    pub time: String,
}

/// Body of `POST /lap-times`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LapTimesPayload {
    pub user_id: PilotId,
    pub stage_id: StageId,
    pub category_id: CategoryId,
    pub battery_index: BatteryIndex,
    pub lap_times: Vec<LapTime>,
}
