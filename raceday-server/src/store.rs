//! # store
//!
//! Race-day state of one stage and the commands that change it.
//!
//! `StageState::apply` is synchronous and validates a command completely
//! before touching anything, so a rejected command leaves the state exactly as
//! it was and produces no events. `StageStore` serializes commands behind a
//! `tokio::sync::RwLock` and broadcasts the resulting events.

use chrono::NaiveTime;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kart_types::{
    BatteryIndex, CategoryId, CategoryRoster, Fleet, FleetId, KartDrawPayload, KartNumber, LapTime,
    LapTimesPayload, NewPenalty, Penalty, PenaltyStatus, PilotId, ScheduleItem, StageId,
    StageResultEntry, Track,
};

use crate::draw::{self, DrawResult, KartError};
use crate::draw_engine::{DrawEngine, SkippedCategory};
use crate::fleet::{min_karts_required, FleetError, FleetRegistry};
use crate::import::{self, ImportError, ImportMode, ImportSummary, ImportTarget};
use crate::ledger::{LedgerError, ResultEdit, ResultLedger};
use crate::penalties::PenaltyBook;
use crate::ranking::{self, RankedRow, SortColumn, SortState};
use crate::workbook::Workbook;

/// `category → battery → pilot → laps`
pub type LapTimeTree = BTreeMap<CategoryId, BTreeMap<BatteryIndex, BTreeMap<PilotId, Vec<LapTime>>>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown category '{0}'")]
    UnknownCategory(CategoryId),
    #[error("pilot '{pilot}' is not registered in category '{category}'")]
    UnknownPilot { category: CategoryId, pilot: PilotId },
    #[error("battery {battery} does not exist in category '{category}' ({count} batteries)")]
    BatteryOutOfRange {
        category: CategoryId,
        battery: BatteryIndex,
        count: usize,
    },
    #[error("unknown track '{0}'")]
    UnknownTrack(String),
    #[error("fleet '{0}' already exists")]
    FleetExists(FleetId),
    #[error("a new fleet needs a track, or a name and a kart count above zero")]
    IncompleteFleet,
    #[error("unknown penalty '{0}'")]
    UnknownPenalty(String),
    #[error("invalid schedule time '{0}', expected HH:MM")]
    InvalidScheduleTime(String),
    #[error(transparent)]
    Fleet(#[from] FleetError),
    #[error(transparent)]
    Kart(#[from] KartError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Import(#[from] ImportError),
}

// ─── Commands ─────────────────────────────────────────────────────────────────

/// Stage definition as fetched from the backend by the admin UI.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSetup {
    pub stage_id: StageId,
    #[serde(default)]
    pub categories: Vec<CategoryRoster>,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub fleets: Vec<Fleet>,
    #[serde(default)]
    pub category_fleet_assignments: BTreeMap<CategoryId, FleetId>,
    #[serde(default)]
    pub kart_draw: Option<DrawResult>,
    #[serde(default)]
    pub stage_results: Option<ResultLedger>,
    #[serde(default)]
    pub schedule: Option<Vec<ScheduleItem>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Command {
    LoadStage(Box<StageSetup>),
    RunDraw,
    SetKart {
        category_id: CategoryId,
        pilot_id: PilotId,
        battery: BatteryIndex,
        kart: KartNumber,
    },
    ClearKart {
        category_id: CategoryId,
        pilot_id: PilotId,
        battery: BatteryIndex,
    },
    AssignFleet {
        category_id: CategoryId,
        fleet_id: Option<FleetId>,
    },
    CreateFleet {
        fleet_id: Option<FleetId>,
        track_id: Option<String>,
        name: Option<String>,
        total_karts: Option<u32>,
    },
    ResizeFleet {
        fleet_id: FleetId,
        total_karts: u32,
    },
    ToggleKart {
        fleet_id: FleetId,
        index: u32,
    },
    UpdateResult {
        category_id: CategoryId,
        pilot_id: PilotId,
        battery: BatteryIndex,
        edit: ResultEdit,
    },
    ClearResults {
        category_id: CategoryId,
        battery: BatteryIndex,
    },
    ImportResults {
        category_id: CategoryId,
        battery: BatteryIndex,
        mode: ImportMode,
        workbook: Workbook,
    },
    SetSort {
        column: SortColumn,
    },
    SaveSchedule {
        items: Vec<ScheduleItem>,
    },
    AddPenalty {
        penalty: NewPenalty,
    },
    DeletePenalty {
        penalty_id: String,
    },
    SetPenaltyStatus {
        penalty_id: String,
        status: PenaltyStatus,
    },
    /// Backend answered a penalty create
    ConfirmPenalty {
        local_id: String,
        penalty: Penalty,
    },
    /// Backend penalty list for the stage
    SyncPenalties {
        penalties: Vec<Penalty>,
    },
}

// ─── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum StageEvent {
    StageLoaded {
        stage_id: StageId,
    },
    DrawCompleted {
        drawn: Vec<CategoryId>,
        skipped: Vec<SkippedCategory>,
        repeats: usize,
    },
    KartAssigned {
        category_id: CategoryId,
        pilot_id: PilotId,
        battery: BatteryIndex,
        kart: KartNumber,
        transferred_from: Option<PilotId>,
    },
    KartCleared {
        category_id: CategoryId,
        pilot_id: PilotId,
        battery: BatteryIndex,
        kart: Option<KartNumber>,
    },
    FleetAssigned {
        category_id: CategoryId,
        fleet_id: Option<FleetId>,
    },
    FleetUpdated {
        fleet: Fleet,
    },
    ResultUpdated {
        category_id: CategoryId,
        pilot_id: PilotId,
        battery: BatteryIndex,
        entry: StageResultEntry,
    },
    ResultsCleared {
        category_id: CategoryId,
        battery: BatteryIndex,
        cleared: usize,
    },
    ResultsImported {
        category_id: CategoryId,
        battery: BatteryIndex,
        mode: ImportMode,
        summary: ImportSummary,
    },
    LapTimesImported {
        category_id: CategoryId,
        battery: BatteryIndex,
        pilots: Vec<PilotId>,
    },
    SortChanged {
        sort: SortState,
    },
    ScheduleSaved {
        items: Vec<ScheduleItem>,
    },
    PenaltyAdded {
        penalty: Penalty,
    },
    PenaltyRemoved {
        penalty_id: String,
    },
    PenaltyUpdated {
        penalty: Penalty,
    },
    PenaltyConfirmed {
        local_id: String,
        penalty: Penalty,
    },
    PenaltiesSynced {
        count: usize,
    },
}

// ─── State ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageState {
    pub stage_id: StageId,
    #[serde(default)]
    pub categories: Vec<CategoryRoster>,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub fleets: FleetRegistry,
    #[serde(default)]
    pub category_fleets: BTreeMap<CategoryId, FleetId>,
    #[serde(default)]
    pub draw: DrawResult,
    #[serde(default)]
    pub results: ResultLedger,
    #[serde(default)]
    pub penalties: PenaltyBook,
    #[serde(default)]
    pub schedule: Vec<ScheduleItem>,
    #[serde(default)]
    pub lap_times: LapTimeTree,
    #[serde(default)]
    pub sort: SortState,
}

impl StageState {
    pub fn category(&self, category_id: &str) -> Result<&CategoryRoster, CommandError> {
        self.categories
            .iter()
            .find(|c| c.id == category_id)
            .ok_or_else(|| CommandError::UnknownCategory(category_id.to_string()))
    }

    fn check_battery(&self, category_id: &str, battery: BatteryIndex) -> Result<&CategoryRoster, CommandError> {
        let category = self.category(category_id)?;
        if battery >= category.battery_count {
            return Err(CommandError::BatteryOutOfRange {
                category: category_id.to_string(),
                battery,
                count: category.battery_count,
            });
        }
        Ok(category)
    }

    fn check_pilot(&self, category_id: &str, pilot_id: &str, battery: BatteryIndex) -> Result<(), CommandError> {
        let category = self.check_battery(category_id, battery)?;
        if !category.pilots.iter().any(|p| p.id == pilot_id) {
            return Err(CommandError::UnknownPilot {
                category: category_id.to_string(),
                pilot: pilot_id.to_string(),
            });
        }
        Ok(())
    }

    fn fleet_of(&self, category_id: &str) -> Option<&Fleet> {
        self.category_fleets
            .get(category_id)
            .and_then(|fleet_id| self.fleets.get(fleet_id))
    }

    fn required_for(&self, fleet_id: &str) -> u32 {
        min_karts_required(fleet_id, &self.categories, &self.category_fleets)
    }

    pub fn kart_draw_payload(&self) -> KartDrawPayload {
        KartDrawPayload {
            results: self.draw.as_tree().clone(),
            category_fleet_assignments: self.category_fleets.clone(),
        }
    }

    pub fn lap_times_payloads(
        &self,
        category_id: &str,
        battery: BatteryIndex,
        pilots: &[PilotId],
    ) -> Vec<LapTimesPayload> {
        let Some(by_pilot) = self.lap_times.get(category_id).and_then(|b| b.get(&battery)) else {
            return Vec::new();
        };
        pilots
            .iter()
            .filter_map(|pilot| {
                by_pilot.get(pilot).map(|laps| LapTimesPayload {
                    user_id: pilot.clone(),
                    stage_id: self.stage_id.clone(),
                    category_id: category_id.to_string(),
                    battery_index: battery,
                    lap_times: laps.clone(),
                })
            })
            .collect()
    }

    pub fn ranking(&self, category_id: &str, battery: BatteryIndex) -> Result<Vec<RankedRow>, CommandError> {
        let category = self.check_battery(category_id, battery)?;
        Ok(ranking::rank_battery(category, battery, &self.draw, &self.results, self.sort))
    }

    /// Apply one command. On error nothing has changed.
    pub fn apply<R: Rng + ?Sized>(&mut self, command: Command, rng: &mut R) -> Result<Vec<StageEvent>, CommandError> {
        match command {
            Command::LoadStage(setup) => Ok(self.load_stage(*setup)),

            Command::RunDraw => {
                let outcome = DrawEngine::draw(rng, &self.categories, &self.category_fleets, &self.fleets);
                for category_id in &outcome.drawn {
                    let assignments = outcome
                        .result
                        .as_tree()
                        .get(category_id)
                        .cloned()
                        .unwrap_or_default();
                    self.draw.replace_category(category_id, assignments);
                }
                Ok(vec![StageEvent::DrawCompleted {
                    drawn: outcome.drawn,
                    skipped: outcome.skipped,
                    repeats: outcome.repeats,
                }])
            }

            Command::SetKart { category_id, pilot_id, battery, kart } => {
                self.check_pilot(&category_id, &pilot_id, battery)?;
                draw::check_kart(self.fleet_of(&category_id), kart)?;

                let transferred_from = self.draw.assign_kart(&category_id, &pilot_id, battery, kart);
                if let Some(previous) = &transferred_from {
                    info!("Kart {kart} moved from {previous} to {pilot_id} ({category_id}/{battery})");
                }
                Ok(vec![StageEvent::KartAssigned { category_id, pilot_id, battery, kart, transferred_from }])
            }

            Command::ClearKart { category_id, pilot_id, battery } => {
                self.check_pilot(&category_id, &pilot_id, battery)?;
                let kart = self.draw.clear_kart(&category_id, &pilot_id, battery);
                Ok(vec![StageEvent::KartCleared { category_id, pilot_id, battery, kart }])
            }

            Command::AssignFleet { category_id, fleet_id } => {
                let category = self.category(&category_id)?;
                if let Some(fleet_id) = &fleet_id {
                    let fleet = self
                        .fleets
                        .get(fleet_id)
                        .ok_or_else(|| FleetError::UnknownFleet(fleet_id.clone()))?;
                    let mut candidate = self.category_fleets.clone();
                    candidate.insert(category_id.clone(), fleet_id.clone());
                    let required = min_karts_required(fleet_id, &self.categories, &candidate);
                    if fleet.active_count() < required {
                        return Err(FleetError::BelowMinimum {
                            fleet: fleet_id.clone(),
                            active: fleet.active_count(),
                            required,
                        }
                        .into());
                    }
                    debug!("Category {} ({} confirmed) → fleet {fleet_id}", category.id, category.confirmed_count());
                    self.category_fleets.insert(category_id.clone(), fleet_id.clone());
                } else {
                    self.category_fleets.remove(&category_id);
                }
                Ok(vec![StageEvent::FleetAssigned { category_id, fleet_id }])
            }

            Command::CreateFleet { fleet_id, track_id, name, total_karts } => {
                let fleet_id = fleet_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                if self.fleets.get(&fleet_id).is_some() {
                    return Err(CommandError::FleetExists(fleet_id));
                }
                let fleet = match (track_id, name, total_karts) {
                    (Some(track_id), _, _) => {
                        let track = self
                            .tracks
                            .iter()
                            .find(|t| t.id == track_id)
                            .ok_or(CommandError::UnknownTrack(track_id))?;
                        if track.default_kart_count == 0 {
                            return Err(CommandError::IncompleteFleet);
                        }
                        self.fleets.create_from_track(&fleet_id, track).clone()
                    }
                    (None, Some(name), Some(total)) if total > 0 => {
                        let fleet = Fleet::new(fleet_id, name, total);
                        self.fleets.upsert(fleet.clone());
                        fleet
                    }
                    _ => return Err(CommandError::IncompleteFleet),
                };
                Ok(vec![StageEvent::FleetUpdated { fleet }])
            }

            Command::ResizeFleet { fleet_id, total_karts } => {
                let required = self.required_for(&fleet_id);
                let fleet = self.fleets.resize(&fleet_id, total_karts, required)?.clone();
                Ok(vec![StageEvent::FleetUpdated { fleet }])
            }

            Command::ToggleKart { fleet_id, index } => {
                let required = self.required_for(&fleet_id);
                self.fleets.toggle_kart(&fleet_id, index, required)?;
                let fleet = self
                    .fleets
                    .get(&fleet_id)
                    .cloned()
                    .ok_or(FleetError::UnknownFleet(fleet_id))?;
                Ok(vec![StageEvent::FleetUpdated { fleet }])
            }

            Command::UpdateResult { category_id, pilot_id, battery, edit } => {
                self.check_pilot(&category_id, &pilot_id, battery)?;
                self.results.apply_edit(&category_id, &pilot_id, battery, edit)?;
                let entry = self
                    .results
                    .entry(&category_id, &pilot_id, battery)
                    .cloned()
                    .unwrap_or_default();
                Ok(vec![StageEvent::ResultUpdated { category_id, pilot_id, battery, entry }])
            }

            Command::ClearResults { category_id, battery } => {
                self.check_battery(&category_id, battery)?;
                let cleared = self.results.clear_battery(&category_id, battery);
                info!("Results cleared: {category_id}/{battery} ({cleared} entries)");
                Ok(vec![StageEvent::ResultsCleared { category_id, battery, cleared }])
            }

            Command::ImportResults { category_id, battery, mode, workbook } => {
                self.check_battery(&category_id, battery)?;
                let karts = self.draw.kart_lookup(&category_id, battery);
                let parsed = import::parse_workbook(&workbook, mode, &karts)?;

                let target = ImportTarget {
                    stage_id: &self.stage_id,
                    category_id: &category_id,
                    battery,
                };
                let applied = import::apply_import(parsed, target, &mut self.results, self.penalties.as_slice());

                let mut events = vec![StageEvent::ResultsImported {
                    category_id: category_id.clone(),
                    battery,
                    mode,
                    summary: applied.summary,
                }];
                for details in applied.new_penalties {
                    let penalty = self.penalties.add_local(details).clone();
                    events.push(StageEvent::PenaltyAdded { penalty });
                }
                if !applied.lap_times.is_empty() {
                    let pilots: Vec<PilotId> = applied.lap_times.keys().cloned().collect();
                    self.lap_times
                        .entry(category_id.clone())
                        .or_default()
                        .entry(battery)
                        .or_default()
                        .extend(applied.lap_times);
                    events.push(StageEvent::LapTimesImported { category_id, battery, pilots });
                }
                Ok(events)
            }

            Command::SetSort { column } => {
                self.sort.toggle(column);
                Ok(vec![StageEvent::SortChanged { sort: self.sort }])
            }

            Command::SaveSchedule { items } => {
                if let Some(bad) = items
                    .iter()
                    .find(|item| NaiveTime::parse_from_str(&item.time, "%H:%M").is_err())
                {
                    return Err(CommandError::InvalidScheduleTime(bad.time.clone()));
                }
                self.schedule = items.clone();
                Ok(vec![StageEvent::ScheduleSaved { items }])
            }

            Command::AddPenalty { mut penalty } => {
                self.check_pilot(&penalty.category_id, &penalty.user_id, penalty.battery_index)?;
                penalty.stage_id = self.stage_id.clone();
                let penalty = self.penalties.add_local(penalty).clone();
                Ok(vec![StageEvent::PenaltyAdded { penalty }])
            }

            Command::DeletePenalty { penalty_id } => {
                self.penalties
                    .remove(&penalty_id)
                    .ok_or_else(|| CommandError::UnknownPenalty(penalty_id.clone()))?;
                Ok(vec![StageEvent::PenaltyRemoved { penalty_id }])
            }

            Command::SetPenaltyStatus { penalty_id, status } => {
                let penalty = self
                    .penalties
                    .set_status(&penalty_id, status)
                    .cloned()
                    .ok_or(CommandError::UnknownPenalty(penalty_id))?;
                Ok(vec![StageEvent::PenaltyUpdated { penalty }])
            }

            Command::ConfirmPenalty { local_id, penalty } => {
                if !self.penalties.confirm(&local_id, penalty.clone()) {
                    warn!("Penalty {local_id} was removed before the backend confirmed it as {}", penalty.id);
                    return Err(CommandError::UnknownPenalty(local_id));
                }
                Ok(vec![StageEvent::PenaltyConfirmed { local_id, penalty }])
            }

            Command::SyncPenalties { penalties } => {
                self.penalties.sync_from_backend(penalties);
                Ok(vec![StageEvent::PenaltiesSynced { count: self.penalties.len() }])
            }
        }
    }

    fn load_stage(&mut self, setup: StageSetup) -> Vec<StageEvent> {
        if setup.stage_id != self.stage_id {
            // local work belongs to another stage
            *self = StageState {
                stage_id: setup.stage_id.clone(),
                ..StageState::default()
            };
        }
        self.categories = setup.categories;
        self.tracks = setup.tracks;
        for fleet in setup.fleets {
            self.fleets.upsert(fleet);
        }
        if !setup.category_fleet_assignments.is_empty() {
            self.category_fleets = setup.category_fleet_assignments;
        }
        if let Some(draw) = setup.kart_draw {
            self.draw = draw;
        }
        if let Some(results) = setup.stage_results {
            self.results = results;
        }
        if let Some(schedule) = setup.schedule {
            self.schedule = schedule;
        }
        info!(
            "Stage {} loaded: {} categories, {} fleets",
            self.stage_id,
            self.categories.len(),
            self.fleets.len()
        );
        vec![StageEvent::StageLoaded { stage_id: self.stage_id.clone() }]
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

struct Guarded {
    state: StageState,
    rng: ChaCha8Rng,
}

/// Shared stage state. Commands run one at a time; readers see whole commands.
pub struct StageStore {
    inner: RwLock<Guarded>,
    events: broadcast::Sender<StageEvent>,
}

impl StageStore {
    pub fn new(state: StageState, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Guarded { state, rng }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StageEvent> {
        self.events.subscribe()
    }

    pub async fn execute(&self, command: Command) -> Result<Vec<StageEvent>, CommandError> {
        let events = {
            let mut guard = self.inner.write().await;
            let Guarded { state, rng } = &mut *guard;
            state.apply(command, rng)?
        };
        for event in &events {
            // no subscribers is fine
            let _ = self.events.send(event.clone());
        }
        Ok(events)
    }

    pub async fn read<T>(&self, f: impl FnOnce(&StageState) -> T) -> T {
        f(&self.inner.read().await.state)
    }

    pub async fn snapshot(&self) -> StageState {
        self.read(StageState::clone).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workbook::Sheet;
    use kart_types::{PenaltyType, Pilot};

    fn roster(id: &str, pilots: usize, batteries: usize) -> CategoryRoster {
        CategoryRoster {
            id: id.into(),
            name: id.to_uppercase(),
            battery_count: batteries,
            pilots: (0..pilots)
                .map(|i| Pilot { id: format!("{id}-p{i}"), name: format!("Pilot {i}"), confirmed: true })
                .collect(),
        }
    }

    fn setup() -> StageSetup {
        StageSetup {
            stage_id: "stage-1".into(),
            categories: vec![roster("gra", 3, 2), roster("nov", 2, 1)],
            tracks: vec![Track { id: "t1".into(), name: "Interlagos".into(), default_kart_count: 6 }],
            ..StageSetup::default()
        }
    }

    fn loaded() -> (StageState, ChaCha8Rng) {
        let mut state = StageState::default();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        state.apply(Command::LoadStage(Box::new(setup())), &mut rng).unwrap();
        let create = Command::CreateFleet {
            fleet_id: Some("f1".into()),
            track_id: Some("t1".into()),
            name: None,
            total_karts: None,
        };
        state.apply(create, &mut rng).unwrap();
        for category in ["gra", "nov"] {
            let assign = Command::AssignFleet { category_id: category.into(), fleet_id: Some("f1".into()) };
            state.apply(assign, &mut rng).unwrap();
        }
        (state, rng)
    }

    #[test]
    fn test_draw_then_manual_transfer() {
        let (mut state, mut rng) = loaded();
        let events = state.apply(Command::RunDraw, &mut rng).unwrap();
        assert!(matches!(&events[0], StageEvent::DrawCompleted { drawn, .. } if drawn.len() == 2));

        let holder_kart = state.draw.kart_of("gra", "gra-p0", 0).unwrap();
        let events = state
            .apply(
                Command::SetKart {
                    category_id: "gra".into(),
                    pilot_id: "gra-p1".into(),
                    battery: 0,
                    kart: holder_kart,
                },
                &mut rng,
            )
            .unwrap();
        assert!(matches!(
            &events[0],
            StageEvent::KartAssigned { transferred_from: Some(from), .. } if from == "gra-p0"
        ));
        assert_eq!(state.draw.kart_of("gra", "gra-p0", 0), None);
    }

    #[test]
    fn test_rejected_commands_leave_state_untouched() {
        let (mut state, mut rng) = loaded();
        let before = state.clone();

        let rejected = vec![
            Command::SetKart { category_id: "gra".into(), pilot_id: "gra-p0".into(), battery: 0, kart: 7 },
            Command::SetKart { category_id: "gra".into(), pilot_id: "nobody".into(), battery: 0, kart: 1 },
            Command::SetKart { category_id: "gra".into(), pilot_id: "gra-p0".into(), battery: 5, kart: 1 },
            Command::ResizeFleet { fleet_id: "f1".into(), total_karts: 2 },
            Command::ToggleKart { fleet_id: "f1".into(), index: 6 },
            Command::UpdateResult {
                category_id: "gra".into(),
                pilot_id: "gra-p0".into(),
                battery: 0,
                edit: ResultEdit::BestLap(Some("abc".into())),
            },
            Command::SaveSchedule {
                items: vec![ScheduleItem { id: "1".into(), label: "Tomada".into(), time: "25:00".into() }],
            },
            Command::DeletePenalty { penalty_id: "nope".into() },
            Command::ImportResults {
                category_id: "gra".into(),
                battery: 0,
                mode: ImportMode::Race,
                workbook: Workbook::new(vec![Sheet::new("x", vec![vec!["nothing".into()]])]),
            },
        ];
        for command in rejected {
            assert!(state.apply(command.clone(), &mut rng).is_err(), "{command:?} accepted");
            assert_eq!(state, before, "{command:?} mutated state");
        }
    }

    #[test]
    fn test_fleet_guard_through_commands() {
        let (mut state, mut rng) = loaded();
        // "gra" has 3 confirmed pilots on a 6-kart fleet
        for index in 0..3 {
            state.apply(Command::ToggleKart { fleet_id: "f1".into(), index }, &mut rng).unwrap();
        }
        let err = state
            .apply(Command::ToggleKart { fleet_id: "f1".into(), index: 3 }, &mut rng)
            .unwrap_err();
        assert!(matches!(err, CommandError::Fleet(FleetError::BelowMinimum { required: 3, .. })));
        assert_eq!(state.fleets.get("f1").unwrap().active_count(), 3);
    }

    #[test]
    fn test_clear_results_keeps_draw() {
        let (mut state, mut rng) = loaded();
        state.apply(Command::RunDraw, &mut rng).unwrap();
        let draw_before = state.draw.clone();
        state
            .apply(
                Command::UpdateResult {
                    category_id: "gra".into(),
                    pilot_id: "gra-p0".into(),
                    battery: 0,
                    edit: ResultEdit::FinishPosition(Some(1)),
                },
                &mut rng,
            )
            .unwrap();
        state
            .apply(Command::ClearResults { category_id: "gra".into(), battery: 0 }, &mut rng)
            .unwrap();

        assert_eq!(state.draw, draw_before);
        let entry = state.results.entry("gra", "gra-p0", 0).unwrap();
        assert_eq!(entry, &StageResultEntry { weight: Some(true), ..Default::default() });
    }

    #[test]
    fn test_import_adds_local_penalties() {
        let (mut state, mut rng) = loaded();
        state
            .apply(Command::SetKart { category_id: "gra".into(), pilot_id: "gra-p2".into(), battery: 0, kart: 5 }, &mut rng)
            .unwrap();
        let sheet = Sheet::new(
            "b1",
            vec![
                vec!["POS".into(), "#".into(), "TT".into()],
                vec!["1".into(), "5".into(), "12:00.000".into()],
                vec!["KART 5 PENALIZADO EM 5 SEC".into()],
            ],
        );
        let events = state
            .apply(
                Command::ImportResults {
                    category_id: "gra".into(),
                    battery: 0,
                    mode: ImportMode::Race,
                    workbook: Workbook::new(vec![sheet]),
                },
                &mut rng,
            )
            .unwrap();

        assert_eq!(events.len(), 2);
        let StageEvent::PenaltyAdded { penalty } = &events[1] else {
            panic!("expected a penalty event, got {:?}", events[1]);
        };
        assert_eq!(penalty.details.penalty_type, PenaltyType::TimePenalty);
        assert_eq!(penalty.details.stage_id, "stage-1");
        assert_eq!(state.penalties.len(), 1);
        assert_eq!(
            state.results.entry("gra", "gra-p2", 0).unwrap().total_time.as_deref(),
            Some("11:55.000")
        );
    }

    #[test]
    fn test_command_wire_shape() {
        let command: Command = serde_json::from_value(serde_json::json!({
            "type": "set-kart",
            "categoryId": "gra",
            "pilotId": "gra-p0",
            "battery": 1,
            "kart": 4
        }))
        .unwrap();
        assert!(matches!(command, Command::SetKart { kart: 4, battery: 1, .. }));

        let event = StageEvent::ResultsCleared { category_id: "gra".into(), battery: 0, cleared: 3 };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({ "type": "results-cleared", "categoryId": "gra", "battery": 0, "cleared": 3 })
        );
    }

    #[test]
    fn test_loading_another_stage_resets_local_work() {
        let (mut state, mut rng) = loaded();
        state.apply(Command::RunDraw, &mut rng).unwrap();
        let other = StageSetup { stage_id: "stage-2".into(), ..setup() };
        state.apply(Command::LoadStage(Box::new(other)), &mut rng).unwrap();
        assert!(state.draw.is_empty());
        assert!(state.fleets.is_empty());
        assert_eq!(state.categories.len(), 2);
    }

    #[tokio::test]
    async fn test_store_broadcasts_only_accepted_commands() {
        let store = StageStore::new(StageState::default(), Some(1));
        let mut events = store.subscribe();

        store.execute(Command::LoadStage(Box::new(setup()))).await.unwrap();
        assert!(store.execute(Command::DeletePenalty { penalty_id: "x".into() }).await.is_err());
        store.execute(Command::SetSort { column: SortColumn::BestLap }).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), StageEvent::StageLoaded { .. }));
        assert!(matches!(events.recv().await.unwrap(), StageEvent::SortChanged { .. }));
        assert!(events.try_recv().is_err());
        assert_eq!(store.read(|s| s.categories.len()).await, 2);
    }
}
