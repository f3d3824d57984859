use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::store::StageState;

/// Load the local stage snapshot. Returns default if file missing or corrupt.
pub async fn load_state(path: &Path) -> StageState {
    if !path.exists() {
        info!("No snapshot at {}, starting empty", path.display());
        return StageState::default();
    }

    match fs::read_to_string(path).await {
        Ok(data) => match serde_json::from_str::<StageState>(&data) {
            Ok(state) => {
                info!(
                    "Loaded snapshot of stage {} ({} categories, {} fleets, {} penalties)",
                    state.stage_id,
                    state.categories.len(),
                    state.fleets.len(),
                    state.penalties.len()
                );
                state
            }
            Err(e) => {
                warn!("Failed to parse {}: {e}, starting empty", path.display());
                StageState::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {e}, starting empty", path.display());
            StageState::default()
        }
    }
}

/// Write the snapshot next to its final path, then move it into place.
pub async fn save_state(path: &Path, state: &StageState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::DrawResult;
    use kart_types::Fleet;

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raceday.json");

        let mut state = StageState { stage_id: "stage-9".into(), ..StageState::default() };
        state.fleets.upsert(Fleet::new("f1", "Aldeia", 12));
        let mut draw = DrawResult::new();
        draw.assign_kart("cat", "ana", 0, 4);
        state.draw = draw;

        save_state(&path, &state).await.unwrap();
        assert_eq!(load_state(&path).await, state);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_or_corrupt_snapshot_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raceday.json");
        assert_eq!(load_state(&path).await, StageState::default());

        fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(load_state(&path).await, StageState::default());
    }
}
