//! # ledger
//!
//! Stage results per category, pilot and battery.
//!
//! Every write goes through validation first; a rejected edit leaves the
//! ledger exactly as it was. Times are stored as normalized strings so the
//! tree serializes straight into the `stage-results` payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use kart_types::{BatteryIndex, PilotId, ResultTree, StageResultEntry};

use crate::race_time::{self, RaceTime, TimeError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{field}: {source}")]
    InvalidTime {
        field: &'static str,
        #[source]
        source: TimeError,
    },
    #[error("{field} must be 1 or greater")]
    InvalidPosition { field: &'static str },
}

/// One manual edit of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "camelCase")]
pub enum ResultEdit {
    StartPosition(Option<u32>),
    FinishPosition(Option<u32>),
    BestLap(Option<String>),
    QualifyingBestLap(Option<String>),
    TotalTime(Option<String>),
    TotalLaps(Option<u32>),
    Weight(bool),
    PenaltyTime(Option<String>),
}

impl ResultEdit {
    /// Validated, normalized form of the edit.
    fn validated(self) -> Result<ResultEdit, LedgerError> {
        fn time(field: &'static str, value: Option<String>) -> Result<Option<String>, LedgerError> {
            value
                .filter(|v| !v.trim().is_empty())
                .map(|v| race_time::validate_manual(&v))
                .transpose()
                .map_err(|source| LedgerError::InvalidTime { field, source })
        }
        fn position(field: &'static str, value: Option<u32>) -> Result<Option<u32>, LedgerError> {
            match value {
                Some(0) => Err(LedgerError::InvalidPosition { field }),
                other => Ok(other),
            }
        }

        Ok(match self {
            ResultEdit::StartPosition(v) => ResultEdit::StartPosition(position("startPosition", v)?),
            ResultEdit::FinishPosition(v) => ResultEdit::FinishPosition(position("finishPosition", v)?),
            ResultEdit::BestLap(v) => ResultEdit::BestLap(time("bestLap", v)?),
            ResultEdit::QualifyingBestLap(v) => ResultEdit::QualifyingBestLap(time("qualifyingBestLap", v)?),
            ResultEdit::TotalTime(v) => ResultEdit::TotalTime(time("totalTime", v)?),
            ResultEdit::PenaltyTime(v) => ResultEdit::PenaltyTime(v.filter(|p| !p.trim().is_empty())),
            other => other,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultLedger(ResultTree);

impl ResultLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tree(tree: ResultTree) -> Self {
        Self(tree)
    }

    pub fn as_tree(&self) -> &ResultTree {
        &self.0
    }

    pub fn entry(&self, category_id: &str, pilot_id: &str, battery: BatteryIndex) -> Option<&StageResultEntry> {
        self.0.get(category_id)?.get(pilot_id)?.get(&battery)
    }

    pub(crate) fn entry_mut(
        &mut self,
        category_id: &str,
        pilot_id: &str,
        battery: BatteryIndex,
    ) -> &mut StageResultEntry {
        self.0
            .entry(category_id.to_string())
            .or_default()
            .entry(pilot_id.to_string())
            .or_default()
            .entry(battery)
            .or_default()
    }

    /// `pilot → entry` for one battery.
    pub fn battery_entries(&self, category_id: &str, battery: BatteryIndex) -> BTreeMap<&PilotId, &StageResultEntry> {
        self.0
            .get(category_id)
            .map(|pilots| {
                pilots
                    .iter()
                    .filter_map(|(pilot, batteries)| batteries.get(&battery).map(|e| (pilot, e)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn apply_edit(
        &mut self,
        category_id: &str,
        pilot_id: &str,
        battery: BatteryIndex,
        edit: ResultEdit,
    ) -> Result<(), LedgerError> {
        let edit = edit.validated()?;
        let entry = self.entry_mut(category_id, pilot_id, battery);
        match edit {
            ResultEdit::StartPosition(v) => entry.start_position = v,
            ResultEdit::FinishPosition(v) => entry.finish_position = v,
            ResultEdit::BestLap(v) => entry.best_lap = v,
            ResultEdit::QualifyingBestLap(v) => entry.qualifying_best_lap = v,
            ResultEdit::TotalTime(v) => entry.total_time = v,
            ResultEdit::TotalLaps(v) => entry.total_laps = v,
            ResultEdit::Weight(v) => entry.weight = Some(v),
            ResultEdit::PenaltyTime(v) => entry.penalty_time = v,
        }
        Ok(())
    }

    /// Wipe one battery of a category: every entry becomes `{ weight: true }`.
    /// Kart assignments live in the draw and are not touched. Returns the
    /// number of entries reset.
    pub fn clear_battery(&mut self, category_id: &str, battery: BatteryIndex) -> usize {
        let Some(pilots) = self.0.get_mut(category_id) else {
            return 0;
        };
        let mut cleared = 0;
        for batteries in pilots.values_mut() {
            if let Some(entry) = batteries.get_mut(&battery) {
                *entry = StageResultEntry {
                    weight: Some(true),
                    ..StageResultEntry::default()
                };
                cleared += 1;
            }
        }
        cleared
    }

    /// Fold `seconds` of time penalty into the pilot's total time.
    ///
    /// `penalty_time` always records the seconds; `total_time` is only reduced
    /// when it holds a parseable time.
    pub fn apply_time_penalty(&mut self, category_id: &str, pilot_id: &str, battery: BatteryIndex, seconds: u32) {
        let entry = self.entry_mut(category_id, pilot_id, battery);
        entry.penalty_time = Some(seconds.to_string());
        if let Some(total) = entry.total_time.as_deref().and_then(|t| t.parse::<RaceTime>().ok()) {
            let real = total.saturating_sub(RaceTime::from_secs(u64::from(seconds)));
            entry.total_time = Some(real.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> ResultLedger {
        let mut ledger = ResultLedger::new();
        for (pilot, pos) in [("ana", 1), ("bia", 2)] {
            ledger.apply_edit("cat", pilot, 0, ResultEdit::StartPosition(Some(pos))).unwrap();
            ledger.apply_edit("cat", pilot, 0, ResultEdit::FinishPosition(Some(pos))).unwrap();
            ledger.apply_edit("cat", pilot, 0, ResultEdit::BestLap(Some("58,1".into()))).unwrap();
            ledger.apply_edit("cat", pilot, 0, ResultEdit::QualifyingBestLap(Some("57.9".into()))).unwrap();
            ledger.apply_edit("cat", pilot, 0, ResultEdit::TotalTime(Some("12:01.5".into()))).unwrap();
            ledger.apply_edit("cat", pilot, 0, ResultEdit::TotalLaps(Some(12))).unwrap();
            ledger.apply_edit("cat", pilot, 0, ResultEdit::Weight(false)).unwrap();
        }
        ledger.apply_edit("cat", "ana", 1, ResultEdit::FinishPosition(Some(3))).unwrap();
        ledger
    }

    #[test]
    fn test_edit_normalizes_time() {
        let ledger = filled();
        assert_eq!(ledger.entry("cat", "ana", 0).unwrap().best_lap.as_deref(), Some("58.1"));
    }

    #[test]
    fn test_invalid_time_is_rejected_without_mutation() {
        let mut ledger = filled();
        let before = ledger.clone();
        let err = ledger
            .apply_edit("cat", "ana", 0, ResultEdit::BestLap(Some("fast".into())))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTime { field: "bestLap", .. }));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_zero_position_is_rejected() {
        let mut ledger = ResultLedger::new();
        assert_eq!(
            ledger.apply_edit("cat", "ana", 0, ResultEdit::FinishPosition(Some(0))),
            Err(LedgerError::InvalidPosition { field: "finishPosition" })
        );
        assert!(ledger.as_tree().is_empty());
    }

    #[test]
    fn test_blank_time_clears_field() {
        let mut ledger = filled();
        ledger.apply_edit("cat", "ana", 0, ResultEdit::TotalTime(Some("  ".into()))).unwrap();
        assert_eq!(ledger.entry("cat", "ana", 0).unwrap().total_time, None);
    }

    #[test]
    fn test_clear_battery_resets_to_compliant_weight() {
        let mut ledger = filled();
        assert_eq!(ledger.clear_battery("cat", 0), 2);

        for pilot in ["ana", "bia"] {
            let entry = ledger.entry("cat", pilot, 0).unwrap();
            assert_eq!(entry, &StageResultEntry { weight: Some(true), ..Default::default() });
        }
        // other batteries are untouched
        assert_eq!(ledger.entry("cat", "ana", 1).unwrap().finish_position, Some(3));
        assert_eq!(ledger.clear_battery("missing", 0), 0);
    }

    #[test]
    fn test_time_penalty_reduces_total() {
        let mut ledger = ResultLedger::new();
        ledger.apply_edit("cat", "ana", 0, ResultEdit::TotalTime(Some("10:00.000".into()))).unwrap();
        ledger.apply_time_penalty("cat", "ana", 0, 10);

        let entry = ledger.entry("cat", "ana", 0).unwrap();
        assert_eq!(entry.total_time.as_deref(), Some("9:50.000"));
        assert_eq!(entry.penalty_time.as_deref(), Some("10"));
    }

    #[test]
    fn test_time_penalty_without_total_only_records_seconds() {
        let mut ledger = ResultLedger::new();
        ledger.apply_time_penalty("cat", "ana", 0, 5);
        let entry = ledger.entry("cat", "ana", 0).unwrap();
        assert_eq!(entry.total_time, None);
        assert_eq!(entry.penalty_time.as_deref(), Some("5"));
    }

    #[test]
    fn test_edit_payload_shape() {
        let edit: ResultEdit =
            serde_json::from_value(serde_json::json!({ "field": "bestLap", "value": "1:02.3" })).unwrap();
        assert_eq!(edit, ResultEdit::BestLap(Some("1:02.3".into())));
        let weight: ResultEdit =
            serde_json::from_value(serde_json::json!({ "field": "weight", "value": false })).unwrap();
        assert_eq!(weight, ResultEdit::Weight(false));
    }
}
