//! Inventory persistence: one JSON record per line in the data directory.
//!
//! Written on launcher shutdown and replayed on the next start so a
//! restarted launcher can adopt still-running children before respawning.

use std::io::{BufRead, Write};
use std::path::Path;

use prism_capabilities::{PrismError, Result};
use prism_patterns::PatternConfig;
use serde::{Deserialize, Serialize};

use crate::process::ProcessRecord;

/// One persisted process: the supervision record plus the pattern config
/// needed to respawn it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedProcess {
    #[serde(flatten)]
    pub record: ProcessRecord,
    pub pattern_config: PatternConfig,
}

pub fn save(path: &Path, snapshot: &[PersistedProcess]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PrismError::fatal(format!("creating {}: {e}", parent.display())))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| PrismError::fatal(format!("creating {}: {e}", tmp.display())))?;
        for persisted in snapshot {
            let line = serde_json::to_string(persisted)?;
            writeln!(file, "{line}")
                .map_err(|e| PrismError::fatal(format!("writing {}: {e}", tmp.display())))?;
        }
        file.flush()
            .map_err(|e| PrismError::fatal(format!("flushing {}: {e}", tmp.display())))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| PrismError::fatal(format!("renaming {}: {e}", path.display())))?;
    Ok(())
}

pub fn load(path: &Path) -> Result<Vec<PersistedProcess>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)
        .map_err(|e| PrismError::fatal(format!("opening {}: {e}", path.display())))?;
    let mut snapshot = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line.map_err(|e| PrismError::fatal(format!("reading {}: {e}", path.display())))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PersistedProcess>(&line) {
            Ok(persisted) => snapshot.push(persisted),
            Err(e) => tracing::warn!("skipping corrupt inventory line: {e}"),
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{IsolationScope, ProcessRecord};
    use tempfile::TempDir;

    #[test]
    fn round_trip_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.jsonl");

        let mut record = ProcessRecord::new(
            "consumer",
            IsolationScope::Namespace {
                namespace: "A".into(),
            },
        );
        record.pid = Some(42);
        record.control_plane_address = Some("127.0.0.1:9000".into());
        let snapshot = vec![PersistedProcess {
            record,
            pattern_config: PatternConfig::new("consumer"),
        }];

        save(&path, &snapshot).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].record.process_id, "ns:A:consumer");
        assert_eq!(loaded[0].record.pid, Some(42));
        assert_eq!(loaded[0].pattern_config.pattern_name, "consumer");
    }

    #[test]
    fn missing_file_is_an_empty_inventory() {
        let dir = TempDir::new().unwrap();
        assert!(load(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }
}
