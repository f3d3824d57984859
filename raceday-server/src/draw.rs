//! Kart assignments per category, pilot and battery.
//!
//! Within one category and battery a kart number is held by at most one pilot.
//! `assign_kart` keeps that true by transferring the kart away from its
//! current holder before writing the new assignment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use kart_types::{BatteryIndex, DrawTree, Fleet, KartNumber, KartSlot, PilotId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KartError {
    #[error("kart {kart} is not part of fleet '{fleet}' (karts 1-{total})")]
    NotInFleet { kart: KartNumber, fleet: String, total: u32 },
}

/// Manual assignments must name a kart of the category's fleet, when it has one.
pub fn check_kart(fleet: Option<&Fleet>, kart: KartNumber) -> Result<(), KartError> {
    match fleet {
        Some(fleet) if !fleet.contains_kart(kart) => Err(KartError::NotInFleet {
            kart,
            fleet: fleet.id.clone(),
            total: fleet.total_karts,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrawResult(DrawTree);

impl DrawResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tree(tree: DrawTree) -> Self {
        Self(tree)
    }

    pub fn as_tree(&self) -> &DrawTree {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kart_of(&self, category_id: &str, pilot_id: &str, battery: BatteryIndex) -> Option<KartNumber> {
        self.0
            .get(category_id)?
            .get(pilot_id)?
            .get(&battery)
            .map(|slot| slot.kart)
    }

    pub fn holder_of(&self, category_id: &str, battery: BatteryIndex, kart: KartNumber) -> Option<&PilotId> {
        self.0.get(category_id)?.iter().find_map(|(pilot, batteries)| {
            (batteries.get(&battery).map(|s| s.kart) == Some(kart)).then_some(pilot)
        })
    }

    /// `pilot → kart` for one battery.
    pub fn battery_assignments(&self, category_id: &str, battery: BatteryIndex) -> BTreeMap<&str, KartNumber> {
        self.0
            .get(category_id)
            .map(|pilots| {
                pilots
                    .iter()
                    .filter_map(|(pilot, batteries)| {
                        batteries.get(&battery).map(|s| (pilot.as_str(), s.kart))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `kart → pilot` lookup used to resolve timing-sheet kart numbers.
    pub fn kart_lookup(&self, category_id: &str, battery: BatteryIndex) -> HashMap<KartNumber, PilotId> {
        self.battery_assignments(category_id, battery)
            .into_iter()
            .map(|(pilot, kart)| (kart, pilot.to_string()))
            .collect()
    }

    /// Give `kart` to `pilot_id`. Returns the pilot the kart was taken from, if any.
    pub fn assign_kart(
        &mut self,
        category_id: &str,
        pilot_id: &str,
        battery: BatteryIndex,
        kart: KartNumber,
    ) -> Option<PilotId> {
        let previous_holder = self
            .holder_of(category_id, battery, kart)
            .filter(|holder| holder.as_str() != pilot_id)
            .cloned();

        if let Some(holder) = &previous_holder {
            self.clear_kart(category_id, holder, battery);
        }

        self.0
            .entry(category_id.to_string())
            .or_default()
            .entry(pilot_id.to_string())
            .or_default()
            .insert(battery, KartSlot { kart });

        previous_holder
    }

    /// Remove the pilot's kart for one battery. Returns the kart that was held.
    pub fn clear_kart(&mut self, category_id: &str, pilot_id: &str, battery: BatteryIndex) -> Option<KartNumber> {
        let pilots = self.0.get_mut(category_id)?;
        let batteries = pilots.get_mut(pilot_id)?;
        let removed = batteries.remove(&battery).map(|s| s.kart);

        if batteries.is_empty() {
            pilots.remove(pilot_id);
        }
        if pilots.is_empty() {
            self.0.remove(category_id);
        }
        removed
    }

    /// Replace every assignment of one category (result of a fresh draw).
    pub fn replace_category(
        &mut self,
        category_id: &str,
        assignments: BTreeMap<PilotId, BTreeMap<BatteryIndex, KartSlot>>,
    ) {
        if assignments.is_empty() {
            self.0.remove(category_id);
        } else {
            self.0.insert(category_id.to_string(), assignments);
        }
    }
}
