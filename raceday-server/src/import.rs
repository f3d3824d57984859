//! # import
//!
//! Timing-sheet import for one category battery.
//!
//! Parsing (`parse_workbook`) only reads the workbook and the current kart
//! draw; it never touches stage state. Applying (`apply_import`) writes the
//! parsed rows into the result ledger and returns the penalties to create.
//!
//! A sheet is only read below a recognised header row. Rows that cannot be
//! read (unknown kart, malformed time) are counted and skipped; only a missing
//! header or an unreadable file fails the whole import.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use kart_types::{
    BatteryIndex, KartNumber, LapTime, NewPenalty, Penalty, PenaltyStatus, PenaltyType, PilotId,
};

use crate::ledger::ResultLedger;
use crate::race_time;
use crate::workbook::Workbook;

static TIME_PENALTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bKART\s+(\d+)\s+PENALIZADO\s+EM\s+(\d+)\s*(?:SEC|SEG)\w*").expect("time penalty pattern")
});

static DISQUALIFIED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bKART\s+(\d+)\s+DESQUALIFICADO").expect("disqualification pattern"));

static BLACK_FLAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)competidor\s+de\s+n\s*[º°o]\.?\s*(\d+)\s+recebeu\s+uma\s+bandeira\s+preta")
        .expect("black flag pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImportMode {
    Race,
    Qualification,
    LapTimes,
}

impl ImportMode {
    fn required_columns(self) -> &'static str {
        match self {
            ImportMode::LapTimes => "#, VLT, TV",
            _ => "POS, #",
        }
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportMode::Race => "race",
            ImportMode::Qualification => "qualification",
            ImportMode::LapTimes => "lapTimes",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImportError {
    #[error("malformed spreadsheet: {0}")]
    Malformed(String),
    #[error("the spreadsheet has no rows")]
    Empty,
    #[error("no header row found for a {mode} import (expected columns {expected})")]
    MissingColumns { mode: ImportMode, expected: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionCell {
    /// `NC`: did not complete
    NotCompleted,
    Place(u32),
}

/// One readable data row, already resolved to a pilot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RowUpdate {
    pub pilot_id: PilotId,
    pub kart: KartNumber,
    pub position: Option<PositionCell>,
    pub best_lap: Option<String>,
    pub total_time: Option<String>,
    pub total_laps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedPenalty {
    pub pilot_id: PilotId,
    pub kart: KartNumber,
    pub penalty_type: PenaltyType,
    pub seconds: Option<u32>,
    /// Matched sheet text; with the pilot it forms the duplicate key
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub sheets: usize,
    pub imported: usize,
    pub not_found_karts: Vec<KartNumber>,
    pub invalid_times: usize,
    pub penalties_created: usize,
    pub penalties_duplicated: usize,
    pub lap_time_pilots: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedImport {
    pub mode: ImportMode,
    pub rows: Vec<RowUpdate>,
    pub penalties: Vec<ExtractedPenalty>,
    pub lap_times: BTreeMap<PilotId, Vec<LapTime>>,
    pub summary: ImportSummary,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedImport {
    pub summary: ImportSummary,
    pub new_penalties: Vec<NewPenalty>,
    pub lap_times: BTreeMap<PilotId, Vec<LapTime>>,
}

/// Where an import lands.
#[derive(Debug, Clone, Copy)]
pub struct ImportTarget<'a> {
    pub stage_id: &'a str,
    pub category_id: &'a str,
    pub battery: BatteryIndex,
}

// ── Header discovery ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Columns {
    position: Option<usize>,
    kart: Option<usize>,
    best_lap: Option<usize>,
    total_time: Option<usize>,
    total_laps: Option<usize>,
    lap: Option<usize>,
    lap_time: Option<usize>,
}

fn claim(slot: &mut Option<usize>, index: usize) {
    if slot.is_none() {
        *slot = Some(index);
    }
}

fn is_kart_label(label: &str) -> bool {
    matches!(label, "#" | "KART" | "Nº" | "N°" | "NO" | "NO.")
}

fn header_columns(row: &[String], mode: ImportMode) -> Option<Columns> {
    let mut cols = Columns::default();

    for (index, cell) in row.iter().enumerate() {
        let label = cell.trim().to_uppercase();
        if label.is_empty() {
            continue;
        }
        if is_kart_label(&label) {
            claim(&mut cols.kart, index);
            continue;
        }
        match mode {
            ImportMode::LapTimes => {
                if label == "VLT" || label == "VOLTA" {
                    claim(&mut cols.lap, index);
                } else if label == "TV" || label.starts_with("TEMPO") {
                    claim(&mut cols.lap_time, index);
                }
            }
            ImportMode::Race | ImportMode::Qualification => {
                if matches!(label.as_str(), "POS" | "POS." | "POSIÇÃO" | "POSICAO") {
                    claim(&mut cols.position, index);
                } else if label == "TMV" || label.contains("MELHOR VOLTA") {
                    claim(&mut cols.best_lap, index);
                } else if label == "TT" || label.contains("TEMPO TOTAL") {
                    claim(&mut cols.total_time, index);
                } else if label == "TV" || label.contains("TOTAL VOLTAS") || label.contains("TOTAL DE VOLTAS") {
                    claim(&mut cols.total_laps, index);
                }
            }
        }
    }

    let complete = match mode {
        ImportMode::LapTimes => cols.kart.is_some() && cols.lap.is_some() && cols.lap_time.is_some(),
        _ => cols.position.is_some() && cols.kart.is_some(),
    };
    complete.then_some(cols)
}

// ── Cells ─────────────────────────────────────────────────────────────────────

fn cell(row: &[String], index: Option<usize>) -> &str {
    index
        .and_then(|i| row.get(i))
        .map(|c| c.trim())
        .unwrap_or("")
}

fn parse_number(raw: &str) -> Option<u32> {
    raw.trim().trim_start_matches('#').trim().parse().ok()
}

fn parse_position(raw: &str) -> Option<PositionCell> {
    let label = raw.trim().to_uppercase();
    if label == "NC" {
        return Some(PositionCell::NotCompleted);
    }
    label
        .trim_end_matches(['º', '°', '.'])
        .parse::<u32>()
        .ok()
        .filter(|p| *p > 0)
        .map(PositionCell::Place)
}

// ── Parsing ───────────────────────────────────────────────────────────────────

struct ParseContext<'a> {
    mode: ImportMode,
    karts: &'a HashMap<KartNumber, PilotId>,
    parsed: ParsedImport,
    not_found: BTreeSet<KartNumber>,
    seen_penalties: HashSet<(PilotId, String)>,
}

impl ParseContext<'_> {
    fn pilot_for(&mut self, kart: KartNumber) -> Option<PilotId> {
        let pilot = self.karts.get(&kart).cloned();
        if pilot.is_none() {
            self.not_found.insert(kart);
        }
        pilot
    }

    /// Validated time cell; empty cells are ignored, bad ones counted.
    fn time_cell(&mut self, raw: &str, valid: fn(&str) -> bool) -> Option<String> {
        if raw.is_empty() {
            return None;
        }
        if valid(raw) {
            Some(race_time::normalize(raw))
        } else {
            self.parsed.summary.invalid_times += 1;
            None
        }
    }

    fn result_rows(&mut self, rows: &[Vec<String>], cols: Columns) {
        for row in rows {
            let Some(kart) = parse_number(cell(row, cols.kart)) else {
                continue;
            };
            let Some(pilot_id) = self.pilot_for(kart) else {
                continue;
            };

            let mut update = RowUpdate {
                pilot_id,
                kart,
                position: parse_position(cell(row, cols.position)),
                best_lap: self.time_cell(cell(row, cols.best_lap), race_time::is_lap_time),
                ..RowUpdate::default()
            };
            if self.mode == ImportMode::Race {
                update.total_time = self.time_cell(cell(row, cols.total_time), race_time::is_total_time);
                update.total_laps = parse_number(cell(row, cols.total_laps));
            }

            self.parsed.summary.imported += 1;
            self.parsed.rows.push(update);
        }
    }

    fn lap_rows(&mut self, rows: &[Vec<String>], cols: Columns) {
        let mut current_kart = None;
        for row in rows {
            // a blank kart cell continues the previous kart's laps
            if let Some(kart) = parse_number(cell(row, cols.kart)) {
                current_kart = Some(kart);
            }
            let Some(lap) = parse_number(cell(row, cols.lap)) else {
                continue;
            };
            let raw_time = cell(row, cols.lap_time);
            let Some(kart) = current_kart.filter(|_| !raw_time.is_empty()) else {
                continue;
            };
            let Some(pilot_id) = self.pilot_for(kart) else {
                continue;
            };
            let Some(time) = self.time_cell(raw_time, race_time::is_lap_time) else {
                continue;
            };

            self.parsed.summary.imported += 1;
            self.parsed
                .lap_times
                .entry(pilot_id)
                .or_default()
                .push(LapTime { lap, time });
        }
    }

    fn penalties(&mut self, rows: &[Vec<String>]) {
        let mut in_observations = false;

        for row in rows {
            let text = row
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if text.is_empty() {
                continue;
            }
            let lower = text.to_lowercase();
            if lower.contains("observa") {
                in_observations = true;
            }

            for caps in TIME_PENALTY.captures_iter(&text) {
                if let (Ok(kart), Ok(seconds)) = (caps[1].parse(), caps[2].parse()) {
                    self.push_penalty(kart, PenaltyType::TimePenalty, Some(seconds), caps[0].trim());
                }
            }
            for caps in DISQUALIFIED.captures_iter(&text) {
                if let Ok(kart) = caps[1].parse() {
                    self.push_penalty(kart, PenaltyType::Disqualification, None, caps[0].trim());
                }
            }
            // orange flag notes share the wording but are not disqualifications
            if in_observations && !lower.contains("laranja") {
                for caps in BLACK_FLAG.captures_iter(&text) {
                    if let Ok(kart) = caps[1].parse() {
                        self.push_penalty(kart, PenaltyType::Disqualification, None, caps[0].trim());
                    }
                }
            }
        }
    }

    fn push_penalty(&mut self, kart: KartNumber, penalty_type: PenaltyType, seconds: Option<u32>, reason: &str) {
        let Some(pilot_id) = self.pilot_for(kart) else {
            return;
        };
        if !self.seen_penalties.insert((pilot_id.clone(), reason.to_string())) {
            return;
        }
        self.parsed.penalties.push(ExtractedPenalty {
            pilot_id,
            kart,
            penalty_type,
            seconds,
            reason: reason.to_string(),
        });
    }
}

/// Read every sheet of `workbook`, resolving kart numbers through `karts`.
pub fn parse_workbook(
    workbook: &Workbook,
    mode: ImportMode,
    karts: &HashMap<KartNumber, PilotId>,
) -> Result<ParsedImport, ImportError> {
    if workbook.is_empty() {
        return Err(ImportError::Empty);
    }

    let mut ctx = ParseContext {
        mode,
        karts,
        parsed: ParsedImport {
            mode,
            rows: Vec::new(),
            penalties: Vec::new(),
            lap_times: BTreeMap::new(),
            summary: ImportSummary::default(),
        },
        not_found: BTreeSet::new(),
        seen_penalties: HashSet::new(),
    };

    for sheet in &workbook.sheets {
        let header = sheet
            .rows
            .iter()
            .enumerate()
            .find_map(|(i, row)| header_columns(row, mode).map(|cols| (i, cols)));

        match header {
            Some((index, cols)) => {
                ctx.parsed.summary.sheets += 1;
                let data = &sheet.rows[index + 1..];
                match mode {
                    ImportMode::LapTimes => ctx.lap_rows(data, cols),
                    _ => ctx.result_rows(data, cols),
                }
            }
            None => debug!("Import: sheet '{}' has no {mode} header, skipped", sheet.name),
        }

        if mode == ImportMode::Race {
            ctx.penalties(&sheet.rows);
        }
    }

    if ctx.parsed.summary.sheets == 0 {
        return Err(ImportError::MissingColumns {
            mode,
            expected: mode.required_columns(),
        });
    }

    let mut parsed = ctx.parsed;
    for laps in parsed.lap_times.values_mut() {
        laps.sort_by_key(|l| l.lap);
        laps.dedup_by_key(|l| l.lap);
    }
    parsed.summary.lap_time_pilots = parsed.lap_times.len();
    parsed.summary.not_found_karts = ctx.not_found.into_iter().collect();
    Ok(parsed)
}

/// Write a parsed import into the ledger.
///
/// Time penalties found in the sheet are subtracted from the total time
/// written by this same import, so importing a sheet twice gives the same
/// result. When the sheet carries no total for a pilot, only penalties created
/// by this import are taken off the stored total. Penalties already on record
/// for the same pilot and reason are not created again.
pub fn apply_import(
    parsed: ParsedImport,
    target: ImportTarget<'_>,
    ledger: &mut ResultLedger,
    existing: &[Penalty],
) -> AppliedImport {
    let ImportTarget { stage_id, category_id, battery } = target;
    let mut summary = parsed.summary;
    let mut totals_written: HashSet<PilotId> = HashSet::new();

    for row in parsed.rows {
        let entry = ledger.entry_mut(category_id, &row.pilot_id, battery);
        let position = row.position.map(|p| match p {
            PositionCell::NotCompleted => None,
            PositionCell::Place(place) => Some(place),
        });

        match parsed.mode {
            ImportMode::Race => {
                if let Some(position) = position {
                    entry.finish_position = position;
                }
                if let Some(best_lap) = row.best_lap {
                    entry.best_lap = Some(best_lap);
                }
                if let Some(total) = row.total_time {
                    entry.total_time = Some(total);
                    entry.penalty_time = None;
                    totals_written.insert(row.pilot_id.clone());
                }
                if let Some(laps) = row.total_laps {
                    entry.total_laps = Some(laps);
                }
            }
            ImportMode::Qualification => {
                if let Some(position) = position {
                    entry.start_position = position;
                }
                if let Some(best_lap) = row.best_lap {
                    entry.qualifying_best_lap = Some(best_lap);
                }
            }
            ImportMode::LapTimes => {}
        }
    }

    // (all seconds in the sheet, seconds from penalties created now)
    let mut seconds_by_pilot: BTreeMap<PilotId, (u32, u32)> = BTreeMap::new();
    let mut new_penalties = Vec::new();
    for penalty in parsed.penalties {
        let duplicate = existing.iter().any(|p| p.matches(&penalty.pilot_id, &penalty.reason));
        if let Some(seconds) = penalty.seconds {
            let (all, new) = seconds_by_pilot.entry(penalty.pilot_id.clone()).or_default();
            *all = all.saturating_add(seconds);
            if !duplicate {
                *new = new.saturating_add(seconds);
            }
        }
        if duplicate {
            summary.penalties_duplicated += 1;
            continue;
        }
        new_penalties.push(NewPenalty {
            penalty_type: penalty.penalty_type,
            status: PenaltyStatus::Applied,
            reason: penalty.reason,
            time_penalty_seconds: penalty.seconds,
            position_penalty: None,
            user_id: penalty.pilot_id,
            stage_id: stage_id.to_string(),
            category_id: category_id.to_string(),
            battery_index: battery,
            is_imported: true,
        });
    }
    summary.penalties_created = new_penalties.len();

    for (pilot_id, (all, new)) in seconds_by_pilot {
        if totals_written.contains(&pilot_id) {
            ledger.apply_time_penalty(category_id, &pilot_id, battery, all);
            continue;
        }
        // the stored total already carries penalties that were on record
        if new > 0 {
            ledger.apply_time_penalty(category_id, &pilot_id, battery, new);
        }
        ledger.entry_mut(category_id, &pilot_id, battery).penalty_time = Some(all.to_string());
    }

    info!(
        "Import {}: {category_id}/{battery}, {} rows, {} unknown karts, {} invalid times, {} new penalties",
        parsed.mode,
        summary.imported,
        summary.not_found_karts.len(),
        summary.invalid_times,
        summary.penalties_created
    );

    AppliedImport {
        summary,
        new_penalties,
        lap_times: parsed.lap_times,
    }
}
