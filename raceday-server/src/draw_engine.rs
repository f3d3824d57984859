use std::collections::{BTreeMap, HashMap, HashSet};

use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use kart_types::{BatteryIndex, CategoryId, CategoryRoster, FleetId, KartNumber, KartSlot, PilotId};

use crate::draw::DrawResult;
use crate::fleet::FleetRegistry;

/// Upper bound (exclusive) of the random weight given to a fresh kart.
const TIE_BREAK_RANGE: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    NoFleetAssigned,
    UnknownFleet,
    NoConfirmedPilots,
    NoBatteries,
    NoActiveKarts,
    NotEnoughKarts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCategory {
    pub category_id: CategoryId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawOutcome {
    pub result: DrawResult,
    /// Categories that received assignments
    pub drawn: Vec<CategoryId>,
    pub skipped: Vec<SkippedCategory>,
    /// Assignments that had to reuse a kart the pilot already drove this draw
    pub repeats: usize,
}

/// Random kart draw for a race stage.
///
/// Each battery is solved as a minimum-cost assignment of confirmed pilots to
/// active karts. Karts a pilot already drove in an earlier battery of the same
/// draw cost more than any repeat-free assignment, so repeats only happen when
/// no repeat-free assignment exists. Random weights on the remaining edges keep
/// the draw a lottery.
pub struct DrawEngine;

impl DrawEngine {
    pub fn draw<R: Rng + ?Sized>(
        rng: &mut R,
        categories: &[CategoryRoster],
        assignments: &BTreeMap<CategoryId, FleetId>,
        fleets: &FleetRegistry,
    ) -> DrawOutcome {
        let mut outcome = DrawOutcome::default();

        for category in categories {
            let skip = |reason| SkippedCategory { category_id: category.id.clone(), reason };

            let Some(fleet_id) = assignments.get(&category.id) else {
                debug!("Draw: {} has no fleet, skipped", category.id);
                outcome.skipped.push(skip(SkipReason::NoFleetAssigned));
                continue;
            };
            let Some(fleet) = fleets.get(fleet_id) else {
                warn!("Draw: {} points at unknown fleet {fleet_id}", category.id);
                outcome.skipped.push(skip(SkipReason::UnknownFleet));
                continue;
            };

            let pilots: Vec<&PilotId> = category.confirmed_pilots().map(|p| &p.id).collect();
            let karts = fleet.active_karts();

            let reason = if pilots.is_empty() {
                Some(SkipReason::NoConfirmedPilots)
            } else if category.battery_count == 0 {
                Some(SkipReason::NoBatteries)
            } else if karts.is_empty() {
                Some(SkipReason::NoActiveKarts)
            } else if karts.len() < pilots.len() {
                Some(SkipReason::NotEnoughKarts)
            } else {
                None
            };
            if let Some(reason) = reason {
                debug!("Draw: {} skipped ({reason:?})", category.id);
                outcome.skipped.push(skip(reason));
                continue;
            }

            let (category_draw, repeats) = Self::draw_category(rng, &pilots, karts, category.battery_count);
            outcome.repeats += repeats;
            outcome.result.replace_category(&category.id, category_draw);
            outcome.drawn.push(category.id.clone());
            info!(
                "Draw: {}, {} pilots × {} batteries from fleet {fleet_id} ({repeats} repeats)",
                category.id,
                pilots.len(),
                category.battery_count
            );
        }

        outcome
    }

    /// Requires `karts.len() >= pilots.len()` and both non-empty.
    fn draw_category<R: Rng + ?Sized>(
        rng: &mut R,
        pilots: &[&PilotId],
        mut karts: Vec<KartNumber>,
        battery_count: usize,
    ) -> (BTreeMap<PilotId, BTreeMap<BatteryIndex, KartSlot>>, usize) {
        let mut pilots: Vec<&PilotId> = pilots.to_vec();
        let mut history: HashMap<&PilotId, HashSet<KartNumber>> = HashMap::new();
        let mut assigned: BTreeMap<PilotId, BTreeMap<BatteryIndex, KartSlot>> = BTreeMap::new();
        let mut repeats = 0;

        // every repeat outweighs the sum of all random weights in a battery
        let repeat_cost = TIE_BREAK_RANGE * (pilots.len() as i64 + 1);

        for battery in 0..battery_count {
            pilots.shuffle(rng);
            karts.shuffle(rng);

            let weights: Vec<i64> = (0..pilots.len() * karts.len())
                .map(|_| rng.gen_range(0..TIE_BREAK_RANGE))
                .collect();
            let costs = Matrix::from_fn(pilots.len(), karts.len(), |(row, col)| {
                let used = history
                    .get(pilots[row])
                    .is_some_and(|karts_used| karts_used.contains(&karts[col]));
                if used {
                    repeat_cost
                } else {
                    weights[row * karts.len() + col]
                }
            });

            let (_, columns) = kuhn_munkres_min(&costs);

            for (row, col) in columns.into_iter().enumerate() {
                let pilot = pilots[row];
                let kart = karts[col];
                if !history.entry(pilot).or_default().insert(kart) {
                    repeats += 1;
                }
                assigned
                    .entry(pilot.clone())
                    .or_default()
                    .insert(battery, KartSlot { kart });
            }
        }

        (assigned, repeats)
    }
}
