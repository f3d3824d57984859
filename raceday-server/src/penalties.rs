//! Stage penalties held locally.
//!
//! Penalties created here carry a `local-` id until the backend answers the
//! create call with its own id (`confirm`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kart_types::{NewPenalty, Penalty, PenaltyStatus};

const LOCAL_PREFIX: &str = "local-";

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_PREFIX)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PenaltyBook {
    penalties: Vec<Penalty>,
}

impl PenaltyBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[Penalty] {
        &self.penalties
    }

    pub fn len(&self) -> usize {
        self.penalties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.penalties.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Penalty> {
        self.penalties.iter().find(|p| p.id == id)
    }

    /// Record a penalty not yet known to the backend.
    pub fn add_local(&mut self, details: NewPenalty) -> &Penalty {
        let penalty = Penalty {
            id: format!("{LOCAL_PREFIX}{}", Uuid::new_v4()),
            details,
        };
        self.penalties.push(penalty);
        let last = self.penalties.len() - 1;
        &self.penalties[last]
    }

    /// Swap a local penalty for the backend's copy. Returns false when the
    /// local id is gone (deleted while the create was in flight).
    pub fn confirm(&mut self, local_id: &str, confirmed: Penalty) -> bool {
        match self.penalties.iter_mut().find(|p| p.id == local_id) {
            Some(slot) => {
                *slot = confirmed;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Penalty> {
        let index = self.penalties.iter().position(|p| p.id == id)?;
        Some(self.penalties.remove(index))
    }

    pub fn set_status(&mut self, id: &str, status: PenaltyStatus) -> Option<&Penalty> {
        let penalty = self.penalties.iter_mut().find(|p| p.id == id)?;
        penalty.details.status = status;
        Some(penalty)
    }

    /// Replace everything the backend knows with `fetched`, keeping local
    /// penalties whose create call has not come back yet.
    pub fn sync_from_backend(&mut self, fetched: Vec<Penalty>) {
        let pending: Vec<Penalty> = self
            .penalties
            .drain(..)
            .filter(|p| is_local_id(&p.id))
            .collect();
        self.penalties = fetched;
        self.penalties.extend(pending);
    }
}
