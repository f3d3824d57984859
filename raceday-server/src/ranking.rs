//! Ranked view of one category battery.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use kart_types::{BatteryIndex, CategoryRoster, KartNumber, PilotId, StageResultEntry};

use crate::draw::DrawResult;
use crate::ledger::ResultLedger;
use crate::race_time::{self, UNSET_TIME_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortColumn {
    #[default]
    #[serde(rename = "kart")]
    Kart,
    #[serde(rename = "peso")]
    Weight,
    #[serde(rename = "classificacao")]
    StartPosition,
    #[serde(rename = "corrida")]
    FinishPosition,
    #[serde(rename = "bestLap")]
    BestLap,
    #[serde(rename = "totalTime")]
    TotalTime,
    #[serde(rename = "piloto")]
    Pilot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortState {
    pub column: SortColumn,
    pub direction: SortDirection,
}

impl SortState {
    /// Same column flips the direction; a new column starts ascending.
    pub fn toggle(&mut self, column: SortColumn) {
        if self.column == column {
            self.direction = match self.direction {
                SortDirection::Asc => SortDirection::Desc,
                SortDirection::Desc => SortDirection::Asc,
            };
        } else {
            self.column = column;
            self.direction = SortDirection::Asc;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRow {
    pub pilot_id: PilotId,
    pub pilot_name: String,
    pub kart: Option<KartNumber>,
    #[serde(flatten)]
    pub entry: StageResultEntry,
    /// Holds the minimum best lap of the battery
    pub fastest_lap: bool,
}

impl RankedRow {
    fn numeric_key(&self, column: SortColumn) -> u64 {
        match column {
            SortColumn::Kart => self.kart.map(u64::from).unwrap_or(0),
            SortColumn::Weight => u64::from(!self.entry.is_below_weight()),
            SortColumn::StartPosition => self.entry.start_position.map(u64::from).unwrap_or(0),
            SortColumn::FinishPosition => self.entry.finish_position.map(u64::from).unwrap_or(0),
            SortColumn::BestLap => race_time::sort_millis(self.entry.best_lap.as_deref()),
            SortColumn::TotalTime => race_time::sort_millis(self.entry.total_time.as_deref()),
            SortColumn::Pilot => 0,
        }
    }

    fn compare(&self, other: &Self, column: SortColumn) -> Ordering {
        match column {
            SortColumn::Pilot => collation_key(&self.pilot_name)
                .cmp(&collation_key(&other.pilot_name))
                .then_with(|| self.pilot_name.to_lowercase().cmp(&other.pilot_name.to_lowercase())),
            _ => self.numeric_key(column).cmp(&other.numeric_key(column)),
        }
    }
}

/// Lowercase name with accents stripped, so "Álvaro" sorts among the A's.
fn collation_key(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Confirmed pilots of `category` with their kart and result for `battery`,
/// sorted by `sort`. Equal keys keep roster order.
pub fn rank_battery(
    category: &CategoryRoster,
    battery: BatteryIndex,
    draw: &DrawResult,
    ledger: &ResultLedger,
    sort: SortState,
) -> Vec<RankedRow> {
    let mut rows: Vec<RankedRow> = category
        .confirmed_pilots()
        .map(|pilot| RankedRow {
            pilot_id: pilot.id.clone(),
            pilot_name: pilot.name.clone(),
            kart: draw.kart_of(&category.id, &pilot.id, battery),
            entry: ledger
                .entry(&category.id, &pilot.id, battery)
                .cloned()
                .unwrap_or_default(),
            fastest_lap: false,
        })
        .collect();

    let fastest = rows
        .iter()
        .map(|r| race_time::sort_millis(r.entry.best_lap.as_deref()))
        .filter(|ms| *ms != UNSET_TIME_MS)
        .min();
    if let Some(fastest) = fastest {
        for row in &mut rows {
            row.fastest_lap = race_time::sort_millis(row.entry.best_lap.as_deref()) == fastest;
        }
    }

    rows.sort_by(|a, b| {
        let ord = a.compare(b, sort.column);
        match sort.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ResultEdit;
    use kart_types::Pilot;

    fn category() -> CategoryRoster {
        let pilot = |id: &str, name: &str, confirmed| Pilot { id: id.into(), name: name.into(), confirmed };
        CategoryRoster {
            id: "cat".into(),
            name: "Graduados".into(),
            battery_count: 2,
            pilots: vec![
                pilot("p1", "carla", true),
                pilot("p2", "Bruno", true),
                pilot("p3", "Ana", true),
                pilot("p4", "Zeca", false),
            ],
        }
    }

    fn setup() -> (DrawResult, ResultLedger) {
        let mut draw = DrawResult::new();
        draw.assign_kart("cat", "p1", 0, 9);
        draw.assign_kart("cat", "p2", 0, 3);

        let mut ledger = ResultLedger::new();
        ledger.apply_edit("cat", "p1", 0, ResultEdit::BestLap(Some("58.100".into()))).unwrap();
        ledger.apply_edit("cat", "p2", 0, ResultEdit::BestLap(Some("1:00.000".into()))).unwrap();
        ledger.apply_edit("cat", "p2", 0, ResultEdit::Weight(false)).unwrap();
        ledger.apply_edit("cat", "p3", 0, ResultEdit::FinishPosition(Some(1))).unwrap();
        (draw, ledger)
    }

    fn order(rows: &[RankedRow]) -> Vec<&str> {
        rows.iter().map(|r| r.pilot_id.as_str()).collect()
    }

    #[test]
    fn test_default_sort_by_kart_with_unassigned_first() {
        let (draw, ledger) = setup();
        let rows = rank_battery(&category(), 0, &draw, &ledger, SortState::default());
        assert_eq!(order(&rows), vec!["p3", "p2", "p1"]);
        assert_eq!(rows[0].kart, None);
        // unconfirmed pilots are never ranked
        assert!(rows.iter().all(|r| r.pilot_id != "p4"));
    }

    #[test]
    fn test_best_lap_unset_sorts_last_and_fastest_is_flagged() {
        let (draw, ledger) = setup();
        let sort = SortState { column: SortColumn::BestLap, direction: SortDirection::Asc };
        let rows = rank_battery(&category(), 0, &draw, &ledger, sort);
        assert_eq!(order(&rows), vec!["p1", "p2", "p3"]);
        assert!(rows[0].fastest_lap);
        assert!(!rows[1].fastest_lap && !rows[2].fastest_lap);
    }

    #[test]
    fn test_fastest_lap_ties_are_all_flagged() {
        let (draw, mut ledger) = setup();
        ledger.apply_edit("cat", "p3", 0, ResultEdit::BestLap(Some("58,1".into()))).unwrap();
        let rows = rank_battery(&category(), 0, &draw, &ledger, SortState::default());
        let flagged: Vec<&str> = rows.iter().filter(|r| r.fastest_lap).map(|r| r.pilot_id.as_str()).collect();
        assert_eq!(flagged, vec!["p3", "p1"]);
    }

    #[test]
    fn test_weight_and_name_columns() {
        let (draw, ledger) = setup();
        let by_weight = SortState { column: SortColumn::Weight, direction: SortDirection::Asc };
        let rows = rank_battery(&category(), 0, &draw, &ledger, by_weight);
        // below weight first, then roster order among compliant
        assert_eq!(order(&rows), vec!["p2", "p1", "p3"]);

        let by_name = SortState { column: SortColumn::Pilot, direction: SortDirection::Desc };
        let rows = rank_battery(&category(), 0, &draw, &ledger, by_name);
        assert_eq!(order(&rows), vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_long_total_sorts_before_unset() {
        let (draw, mut ledger) = setup();
        ledger.apply_edit("cat", "p2", 0, ResultEdit::TotalTime(Some("17:00.000".into()))).unwrap();
        ledger.apply_edit("cat", "p3", 0, ResultEdit::TotalTime(Some("1:05:00.000".into()))).unwrap();
        let sort = SortState { column: SortColumn::TotalTime, direction: SortDirection::Asc };
        let rows = rank_battery(&category(), 0, &draw, &ledger, sort);
        assert_eq!(order(&rows), vec!["p2", "p3", "p1"]);
    }

    #[test]
    fn test_accented_names_sort_with_their_letter() {
        let pilot = |id: &str, name: &str| Pilot { id: id.into(), name: name.into(), confirmed: true };
        let category = CategoryRoster {
            id: "cat".into(),
            name: "Novatos".into(),
            battery_count: 1,
            pilots: vec![pilot("z", "Zeca"), pilot("a", "Álvaro"), pilot("b", "Bruno"), pilot("e", "élio")],
        };
        let by_name = SortState { column: SortColumn::Pilot, direction: SortDirection::Asc };
        let rows = rank_battery(&category, 0, &DrawResult::new(), &ResultLedger::new(), by_name);
        assert_eq!(order(&rows), vec!["a", "b", "e", "z"]);
    }

    #[test]
    fn test_toggle() {
        let mut sort = SortState::default();
        sort.toggle(SortColumn::Kart);
        assert_eq!(sort.direction, SortDirection::Desc);
        sort.toggle(SortColumn::Kart);
        assert_eq!(sort.direction, SortDirection::Asc);
        sort.toggle(SortColumn::Kart);
        sort.toggle(SortColumn::TotalTime);
        assert_eq!(sort, SortState { column: SortColumn::TotalTime, direction: SortDirection::Asc });
    }

    #[test]
    fn test_sort_column_names() {
        let sort: SortState = serde_json::from_value(serde_json::json!({
            "column": "classificacao",
            "direction": "desc"
        }))
        .unwrap();
        assert_eq!(sort.column, SortColumn::StartPosition);
        assert_eq!(serde_json::to_value(SortColumn::Weight).unwrap(), "peso");
    }
}
