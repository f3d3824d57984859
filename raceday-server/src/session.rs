//! # session
//!
//! Race-day session: runs commands against the stage store and persists what
//! they changed.
//!
//! | change                         | persisted through                         |
//! |--------------------------------|-------------------------------------------|
//! | draw, kart edits, fleet links  | `PATCH kart-draw`, immediately            |
//! | result edits, clears, imports  | `PATCH stage-results`, debounced          |
//! | schedule                       | `PUT schedule`, immediately               |
//! | penalties                      | `POST` / `PATCH` / `DELETE /penalties`    |
//! | imported lap times             | `DELETE` battery laps, then `POST` each   |
//! | anything                       | local snapshot file, debounced            |
//!
//! Backend failures are logged and retried; local state is never rolled back.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use kart_types::{BatteryIndex, CategoryId, LapTimesPayload, Penalty, ResultTree, StageId};

use crate::api_client::{ApiError, StageBackend};
use crate::autosave::{write_with_retry, AutoSaveConfig, AutoSaver};
use crate::penalties::is_local_id;
use crate::persistence::save_state;
use crate::store::{Command, CommandError, StageEvent, StageState, StageStore};

pub struct RaceDaySession<S> {
    store: Arc<StageStore>,
    backend: Arc<S>,
    config: AutoSaveConfig,
    results: AutoSaver<(StageId, ResultTree)>,
    snapshots: Option<AutoSaver<StageState>>,
}

impl<S: StageBackend> RaceDaySession<S> {
    pub fn new(
        store: Arc<StageStore>,
        backend: Arc<S>,
        config: AutoSaveConfig,
        state_file: Option<PathBuf>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut tasks = Vec::new();

        let (results, task) = {
            let backend = backend.clone();
            AutoSaver::spawn("stage-results", config, move |(stage_id, tree): (StageId, ResultTree)| {
                let backend = backend.clone();
                async move { backend.save_stage_results(&stage_id, &tree).await }
            })
        };
        tasks.push(task);

        let snapshots = state_file.map(|path| {
            let (saver, task) = AutoSaver::spawn("snapshot", config, move |state: StageState| {
                let path = path.clone();
                async move { save_state(&path, &state).await }
            });
            tasks.push(task);
            saver
        });

        let session = Self {
            store,
            backend,
            config,
            results,
            snapshots,
        };
        (session, tasks)
    }

    pub fn store(&self) -> &Arc<StageStore> {
        &self.store
    }

    /// Apply `command` and start persisting its effects.
    pub async fn execute(&self, command: Command) -> Result<Vec<StageEvent>, CommandError> {
        let events = self.store.execute(command).await?;
        self.persist(&events).await;
        Ok(events)
    }

    async fn persist(&self, events: &[StageEvent]) {
        let state = self.store.snapshot().await;
        let mut draw_changed = false;
        let mut results_changed = false;

        for event in events {
            match event {
                StageEvent::DrawCompleted { .. }
                | StageEvent::KartAssigned { .. }
                | StageEvent::KartCleared { .. }
                | StageEvent::FleetAssigned { .. } => draw_changed = true,

                StageEvent::ResultUpdated { .. }
                | StageEvent::ResultsCleared { .. }
                | StageEvent::ResultsImported { .. } => results_changed = true,

                StageEvent::ScheduleSaved { items } => {
                    let backend = self.backend.clone();
                    self.spawn_write("schedule", (state.stage_id.clone(), items.clone()), move |(id, items)| {
                        let backend = backend.clone();
                        async move { backend.save_schedule(&id, &items).await }
                    });
                }

                StageEvent::PenaltyAdded { penalty } => self.spawn_penalty_create(penalty.clone()),

                StageEvent::PenaltyRemoved { penalty_id } if !is_local_id(penalty_id) => {
                    let backend = self.backend.clone();
                    self.spawn_write("penalty-delete", penalty_id.clone(), move |id| {
                        let backend = backend.clone();
                        async move { backend.delete_penalty(&id).await }
                    });
                }

                StageEvent::PenaltyUpdated { penalty } if !is_local_id(&penalty.id) => {
                    let backend = self.backend.clone();
                    let status = penalty.details.status;
                    self.spawn_write("penalty-status", penalty.id.clone(), move |id| {
                        let backend = backend.clone();
                        async move { backend.update_penalty_status(&id, status).await }
                    });
                }

                StageEvent::PenaltyRemoved { .. } | StageEvent::PenaltyUpdated { .. } => {
                    debug!("Penalty change kept local until the backend confirms the penalty");
                }

                StageEvent::LapTimesImported { category_id, battery, pilots } => {
                    let payloads = state.lap_times_payloads(category_id, *battery, pilots);
                    self.spawn_lap_times_replace(state.stage_id.clone(), category_id.clone(), *battery, payloads);
                }

                StageEvent::StageLoaded { stage_id } => self.spawn_penalty_sync(stage_id.clone()),

                StageEvent::FleetUpdated { .. }
                | StageEvent::SortChanged { .. }
                | StageEvent::PenaltyConfirmed { .. }
                | StageEvent::PenaltiesSynced { .. } => {}
            }
        }

        if draw_changed {
            let backend = self.backend.clone();
            let payload = (state.stage_id.clone(), state.kart_draw_payload());
            self.spawn_write("kart-draw", payload, move |(id, draw)| {
                let backend = backend.clone();
                async move { backend.save_kart_draw(&id, &draw).await }
            });
        }
        if results_changed {
            self.results
                .schedule((state.stage_id.clone(), state.results.as_tree().clone()));
        }
        if let Some(snapshots) = &self.snapshots {
            snapshots.schedule(state);
        }
    }

    /// Write anything still inside a debounce window, then return.
    pub async fn flush(&self) {
        self.results.flush().await;
        if let Some(snapshots) = &self.snapshots {
            snapshots.flush().await;
        }
    }

    fn spawn_write<T, F, Fut>(&self, name: &'static str, payload: T, write: F)
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ApiError>> + Send,
    {
        let config = self.config;
        tokio::spawn(async move {
            write_with_retry(name, &config, &payload, &write).await;
        });
    }

    /// A re-import replaces the battery's laps on the backend instead of
    /// adding to them.
    fn spawn_lap_times_replace(
        &self,
        stage_id: StageId,
        category_id: CategoryId,
        battery: BatteryIndex,
        payloads: Vec<LapTimesPayload>,
    ) {
        let backend = self.backend.clone();
        let config = self.config;
        tokio::spawn(async move {
            let clear = |(): ()| {
                let backend = backend.clone();
                let (stage_id, category_id) = (stage_id.clone(), category_id.clone());
                async move {
                    match backend.delete_lap_times(&stage_id, &category_id, battery).await {
                        // nothing stored yet
                        Err(ApiError::Status { status: 404, .. }) => Ok(()),
                        other => other,
                    }
                }
            };
            if !write_with_retry("lap-times-clear", &config, &(), &clear).await {
                error!("Lap times of {category_id}/{battery} not replaced, old laps still on the backend");
                return;
            }
            let save = |payload: LapTimesPayload| {
                let backend = backend.clone();
                async move { backend.save_lap_times(&payload).await }
            };
            for payload in payloads {
                write_with_retry("lap-times", &config, &payload, &save).await;
            }
        });
    }

    fn spawn_penalty_create(&self, penalty: Penalty) {
        let backend = self.backend.clone();
        let store = self.store.clone();
        let snapshots = self.snapshots.clone();
        tokio::spawn(async move {
            let created = match backend.create_penalty(&penalty.details).await {
                Ok(created) => created,
                Err(e) => {
                    error!("Penalty for {} not saved: {e}", penalty.details.user_id);
                    return;
                }
            };
            let confirm = Command::ConfirmPenalty {
                local_id: penalty.id,
                penalty: created,
            };
            match store.execute(confirm).await {
                Ok(_) => {
                    if let Some(snapshots) = snapshots {
                        snapshots.schedule(store.snapshot().await);
                    }
                }
                Err(e) => warn!("Penalty confirmation dropped: {e}"),
            }
        });
    }

    fn spawn_penalty_sync(&self, stage_id: StageId) {
        let backend = self.backend.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            match backend.list_penalties(&stage_id).await {
                Ok(penalties) => {
                    if let Err(e) = store.execute(Command::SyncPenalties { penalties }).await {
                        warn!("Penalty sync for {stage_id} failed: {e}");
                    }
                }
                Err(e) => error!("Could not load penalties of {stage_id}: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ResultEdit;
    use crate::store::StageSetup;
    use crate::import::ImportMode;
    use crate::workbook::{Sheet, Workbook};
    use kart_types::{CategoryRoster, KartDrawPayload, NewPenalty, PenaltyStatus, PenaltyType, Pilot, ScheduleItem};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        KartDraw(KartDrawPayload),
        Results(ResultTree),
        Schedule(Vec<ScheduleItem>),
        ListPenalties,
        CreatePenalty(String),
        DeletePenalty(String),
        PenaltyStatus(String, PenaltyStatus),
        LapTimes(String),
        ClearLapTimes(String, BatteryIndex),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StageBackend for Recorder {
        async fn save_kart_draw(&self, _: &str, payload: &KartDrawPayload) -> Result<(), ApiError> {
            self.record(Call::KartDraw(payload.clone()));
            Ok(())
        }

        async fn save_stage_results(&self, _: &str, results: &ResultTree) -> Result<(), ApiError> {
            self.record(Call::Results(results.clone()));
            Ok(())
        }

        async fn save_schedule(&self, _: &str, items: &[ScheduleItem]) -> Result<(), ApiError> {
            self.record(Call::Schedule(items.to_vec()));
            Ok(())
        }

        async fn list_penalties(&self, _: &str) -> Result<Vec<Penalty>, ApiError> {
            self.record(Call::ListPenalties);
            Ok(Vec::new())
        }

        async fn create_penalty(&self, penalty: &NewPenalty) -> Result<Penalty, ApiError> {
            self.record(Call::CreatePenalty(penalty.reason.clone()));
            Ok(Penalty { id: "p-1".into(), details: penalty.clone() })
        }

        async fn delete_penalty(&self, penalty_id: &str) -> Result<(), ApiError> {
            self.record(Call::DeletePenalty(penalty_id.to_string()));
            Ok(())
        }

        async fn update_penalty_status(&self, penalty_id: &str, status: PenaltyStatus) -> Result<(), ApiError> {
            self.record(Call::PenaltyStatus(penalty_id.to_string(), status));
            Ok(())
        }

        async fn save_lap_times(&self, payload: &LapTimesPayload) -> Result<(), ApiError> {
            self.record(Call::LapTimes(payload.user_id.clone()));
            Ok(())
        }

        async fn delete_lap_times(&self, _: &str, category_id: &str, battery: BatteryIndex) -> Result<(), ApiError> {
            self.record(Call::ClearLapTimes(category_id.to_string(), battery));
            Err(ApiError::Status { status: 404, message: "no laps".into() })
        }
    }

    fn session() -> (RaceDaySession<Recorder>, Arc<Recorder>) {
        let backend = Arc::new(Recorder::default());
        let store = Arc::new(StageStore::new(StageState::default(), Some(5)));
        let (session, _tasks) = RaceDaySession::new(store, backend.clone(), AutoSaveConfig::default(), None);
        (session, backend)
    }

    fn setup() -> StageSetup {
        StageSetup {
            stage_id: "s1".into(),
            categories: vec![CategoryRoster {
                id: "cat".into(),
                name: "Cat".into(),
                battery_count: 1,
                pilots: vec![Pilot { id: "ana".into(), name: "Ana".into(), confirmed: true }],
            }],
            ..StageSetup::default()
        }
    }

    async fn settle() {
        // let spawned writes and the debounce window run out
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_edits_are_debounced_into_one_write() {
        let (session, backend) = session();
        session.execute(Command::LoadStage(Box::new(setup()))).await.unwrap();
        for lap in ["58.1", "57.9", "57.5"] {
            session
                .execute(Command::UpdateResult {
                    category_id: "cat".into(),
                    pilot_id: "ana".into(),
                    battery: 0,
                    edit: ResultEdit::BestLap(Some(lap.into())),
                })
                .await
                .unwrap();
        }
        settle().await;

        let writes: Vec<ResultTree> = backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Results(tree) => Some(tree),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0]["cat"]["ana"][&0].best_lap.as_deref(), Some("57.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kart_edit_saves_draw_immediately() {
        let (session, backend) = session();
        session.execute(Command::LoadStage(Box::new(setup()))).await.unwrap();
        session
            .execute(Command::SetKart { category_id: "cat".into(), pilot_id: "ana".into(), battery: 0, kart: 3 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = backend.calls();
        let draw = calls.iter().find_map(|c| match c {
            Call::KartDraw(payload) => Some(payload),
            _ => None,
        });
        assert_eq!(draw.unwrap().results["cat"]["ana"][&0].kart, 3);
        assert!(calls.contains(&Call::ListPenalties));
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_lifecycle_uses_backend_id() {
        let (session, backend) = session();
        session.execute(Command::LoadStage(Box::new(setup()))).await.unwrap();
        let penalty = NewPenalty {
            penalty_type: PenaltyType::Warning,
            status: PenaltyStatus::Pending,
            reason: "contato".into(),
            time_penalty_seconds: None,
            position_penalty: None,
            user_id: "ana".into(),
            stage_id: String::new(),
            category_id: "cat".into(),
            battery_index: 0,
            is_imported: false,
        };
        session.execute(Command::AddPenalty { penalty }).await.unwrap();
        settle().await;
        assert!(session.store().read(|s| s.penalties.get("p-1").is_some()).await);

        session
            .execute(Command::SetPenaltyStatus { penalty_id: "p-1".into(), status: PenaltyStatus::Applied })
            .await
            .unwrap();
        session.execute(Command::DeletePenalty { penalty_id: "p-1".into() }).await.unwrap();
        settle().await;

        let calls = backend.calls();
        assert!(calls.contains(&Call::CreatePenalty("contato".into())));
        assert!(calls.contains(&Call::PenaltyStatus("p-1".into(), PenaltyStatus::Applied)));
        assert!(calls.contains(&Call::DeletePenalty("p-1".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_persists_nothing() {
        let (session, backend) = session();
        let err = session
            .execute(Command::SaveSchedule {
                items: vec![ScheduleItem { id: "1".into(), label: "Final".into(), time: "9h".into() }],
            })
            .await;
        assert!(err.is_err());
        settle().await;
        assert!(backend.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_sends_debounced_results_at_once() {
        let (session, backend) = session();
        session.execute(Command::LoadStage(Box::new(setup()))).await.unwrap();
        session
            .execute(Command::UpdateResult {
                category_id: "cat".into(),
                pilot_id: "ana".into(),
                battery: 0,
                edit: ResultEdit::FinishPosition(Some(1)),
            })
            .await
            .unwrap();

        session.flush().await;
        assert!(backend.calls().iter().any(|c| matches!(c, Call::Results(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lap_times_import_replaces_battery_laps() {
        let (session, backend) = session();
        session.execute(Command::LoadStage(Box::new(setup()))).await.unwrap();
        session
            .execute(Command::SetKart { category_id: "cat".into(), pilot_id: "ana".into(), battery: 0, kart: 7 })
            .await
            .unwrap();
        let rows: Vec<Vec<String>> = [["#", "VLT", "TV"], ["7", "1", "58.100"], ["", "2", "57.900"]]
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect();
        session
            .execute(Command::ImportResults {
                category_id: "cat".into(),
                battery: 0,
                mode: ImportMode::LapTimes,
                workbook: Workbook::new(vec![Sheet::new("voltas", rows)]),
            })
            .await
            .unwrap();
        settle().await;

        let laps: Vec<Call> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::ClearLapTimes(..) | Call::LapTimes(_)))
            .collect();
        // a missing battery on the backend (404) still lets the new laps through
        assert_eq!(laps, vec![Call::ClearLapTimes("cat".into(), 0), Call::LapTimes("ana".into())]);
    }
}
