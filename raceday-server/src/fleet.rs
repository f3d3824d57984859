//! # fleet
//!
//! Stage fleet registry and the kart-count guard.
//!
//! A fleet edit (resize, kart toggle) is only committed when the fleet keeps at
//! least as many active karts as the largest confirmed roster of any category
//! drawing from it. Rejected edits leave the registry untouched.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

use kart_types::{CategoryId, CategoryRoster, Fleet, FleetId, Track};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("unknown fleet '{0}'")]
    UnknownFleet(FleetId),
    #[error("fleet '{fleet}' would keep {active} active karts, {required} required by confirmed pilots")]
    BelowMinimum {
        fleet: FleetId,
        active: u32,
        required: u32,
    },
    #[error("kart index {index} is outside fleet '{fleet}' ({total} karts)")]
    KartOutOfRange { fleet: FleetId, index: u32, total: u32 },
}

/// Largest confirmed roster among the categories drawing from `fleet_id`.
pub fn min_karts_required(
    fleet_id: &str,
    categories: &[CategoryRoster],
    assignments: &BTreeMap<CategoryId, FleetId>,
) -> u32 {
    categories
        .iter()
        .filter(|c| assignments.get(&c.id).map(String::as_str) == Some(fleet_id))
        .map(|c| c.confirmed_count() as u32)
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FleetRegistry {
    fleets: BTreeMap<FleetId, Fleet>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Fleet> {
        self.fleets.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fleet> {
        self.fleets.values()
    }

    pub fn len(&self) -> usize {
        self.fleets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fleets.is_empty()
    }

    /// Insert or replace a fleet. Returns the previous definition.
    pub fn upsert(&mut self, fleet: Fleet) -> Option<Fleet> {
        info!("Fleet {}: {} karts ({} active)", fleet.id, fleet.total_karts, fleet.active_count());
        self.fleets.insert(fleet.id.clone(), fleet)
    }

    pub fn create_from_track(&mut self, fleet_id: &str, track: &Track) -> &Fleet {
        let fleet = Fleet::from_track(fleet_id, track);
        self.upsert(fleet);
        &self.fleets[fleet_id]
    }

    /// Change the total kart count. Inactive indexes past the new size are dropped.
    pub fn resize(&mut self, fleet_id: &str, total_karts: u32, required: u32) -> Result<&Fleet, FleetError> {
        let current = self
            .fleets
            .get(fleet_id)
            .ok_or_else(|| FleetError::UnknownFleet(fleet_id.to_string()))?;

        let mut candidate = current.clone();
        candidate.total_karts = total_karts;
        candidate.inactive_karts.retain(|i| *i < total_karts);

        let active = candidate.active_count();
        if active < required || total_karts == 0 {
            warn!("Fleet {fleet_id}: resize to {total_karts} rejected ({active} active, {required} required)");
            return Err(FleetError::BelowMinimum {
                fleet: fleet_id.to_string(),
                active,
                required,
            });
        }

        self.fleets.insert(fleet_id.to_string(), candidate);
        Ok(&self.fleets[fleet_id])
    }

    /// Flip one kart between active and inactive. Returns the new active state.
    pub fn toggle_kart(&mut self, fleet_id: &str, index: u32, required: u32) -> Result<bool, FleetError> {
        let fleet = self
            .fleets
            .get_mut(fleet_id)
            .ok_or_else(|| FleetError::UnknownFleet(fleet_id.to_string()))?;

        if index >= fleet.total_karts {
            return Err(FleetError::KartOutOfRange {
                fleet: fleet_id.to_string(),
                index,
                total: fleet.total_karts,
            });
        }

        if fleet.inactive_karts.remove(&index) {
            return Ok(true);
        }

        let active = fleet.active_count() - 1;
        if active < required {
            warn!("Fleet {fleet_id}: deactivating kart {} rejected ({active} active, {required} required)", index + 1);
            return Err(FleetError::BelowMinimum {
                fleet: fleet_id.to_string(),
                active,
                required,
            });
        }
        fleet.inactive_karts.insert(index);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kart_types::Pilot;

    fn roster(id: &str, confirmed: usize) -> CategoryRoster {
        CategoryRoster {
            id: id.into(),
            name: id.to_uppercase(),
            battery_count: 2,
            pilots: (0..confirmed + 1)
                .map(|i| Pilot {
                    id: format!("{id}-p{i}"),
                    name: format!("Pilot {i}"),
                    // last pilot is registered but not confirmed
                    confirmed: i < confirmed,
                })
                .collect(),
        }
    }

    fn setup() -> (FleetRegistry, Vec<CategoryRoster>, BTreeMap<CategoryId, FleetId>) {
        let mut registry = FleetRegistry::new();
        registry.upsert(Fleet::new("f1", "Main", 6));
        let categories = vec![roster("junior", 3), roster("senior", 5)];
        let assignments = BTreeMap::from([
            ("junior".to_string(), "f1".to_string()),
            ("senior".to_string(), "f1".to_string()),
        ]);
        (registry, categories, assignments)
    }

    #[test]
    fn test_min_karts_uses_largest_confirmed_roster() {
        let (_, categories, assignments) = setup();
        assert_eq!(min_karts_required("f1", &categories, &assignments), 5);
        assert_eq!(min_karts_required("other", &categories, &assignments), 0);
    }

    #[test]
    fn test_resize_below_minimum_is_rejected_without_mutation() {
        let (mut registry, categories, assignments) = setup();
        let required = min_karts_required("f1", &categories, &assignments);
        let before = registry.clone();

        let err = registry.resize("f1", 4, required).unwrap_err();
        assert_eq!(
            err,
            FleetError::BelowMinimum { fleet: "f1".into(), active: 4, required: 5 }
        );
        assert_eq!(registry, before);
    }

    #[test]
    fn test_resize_drops_out_of_range_inactive_karts() {
        let (mut registry, _, _) = setup();
        registry.toggle_kart("f1", 5, 0).unwrap();
        let fleet = registry.resize("f1", 5, 5).unwrap();
        assert!(fleet.inactive_karts.is_empty());
        assert_eq!(fleet.active_count(), 5);
    }

    #[test]
    fn test_toggle_guard() {
        let (mut registry, categories, assignments) = setup();
        let required = min_karts_required("f1", &categories, &assignments);

        assert_eq!(registry.toggle_kart("f1", 0, required), Ok(false));
        assert_eq!(registry.get("f1").unwrap().active_count(), 5);

        let before = registry.clone();
        assert!(matches!(
            registry.toggle_kart("f1", 1, required),
            Err(FleetError::BelowMinimum { active: 4, required: 5, .. })
        ));
        assert_eq!(registry, before);

        // reactivating is always allowed
        assert_eq!(registry.toggle_kart("f1", 0, required), Ok(true));
        assert_eq!(registry.get("f1").unwrap().active_karts(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_toggle_out_of_range() {
        let (mut registry, _, _) = setup();
        assert!(matches!(
            registry.toggle_kart("f1", 6, 0),
            Err(FleetError::KartOutOfRange { index: 6, total: 6, .. })
        ));
        assert_eq!(
            registry.toggle_kart("nope", 0, 0),
            Err(FleetError::UnknownFleet("nope".into()))
        );
    }

    #[test]
    fn test_fleet_from_track_preset() {
        let mut registry = FleetRegistry::new();
        let track = Track { id: "t1".into(), name: "Granja Viana".into(), default_kart_count: 22 };
        let fleet = registry.create_from_track("f-granja", &track);
        assert_eq!(fleet.total_karts, 22);
        assert_eq!(fleet.name, "Granja Viana fleet");
    }
}
