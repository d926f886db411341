//! Artifact lineage store (§4.2): per-artifact edit history plus a
//! path-keyed import-graph relation, replacing the cyclic in-object
//! references the REDESIGN FLAGS call out (§9). Persisted whole via
//! `persist::atomic_write_json`, matching the teacher's `state.rs` discipline
//! of never leaving a half-written state file on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::persist::{atomic_write_json, load_json};
use crate::types::{Artifact, ArtifactEdit, ArtifactLineage, EditSource, EditType, LINEAGE_SCHEMA_VERSION};

pub const LINEAGE_FILE: &str = "lineage.json";

/// Bundles `record_edit`'s non-content arguments; kept as one struct rather
/// than five positional parameters so call sites read as field names.
#[derive(Debug, Clone)]
pub struct EditParams {
    pub goal_id: Option<String>,
    pub task_id: Option<String>,
    pub source: EditSource,
    pub lines_added: u64,
    pub lines_removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactLineageStore {
    schema_version: String,
    /// Keyed by path so lookups and the import graph stay path-addressed;
    /// identity survives renames via `artifact_id`, not the map key.
    by_path: BTreeMap<String, ArtifactLineage>,
}

impl Default for ArtifactLineageStore {
    fn default() -> Self {
        Self { schema_version: LINEAGE_SCHEMA_VERSION.to_string(), by_path: BTreeMap::new() }
    }
}

pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

impl ArtifactLineageStore {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_json::<Self>(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }

    pub fn get(&self, path: &str) -> Option<&ArtifactLineage> {
        self.by_path.get(path)
    }

    pub fn record_create(
        &mut self,
        path: &str,
        content: &[u8],
        goal_id: Option<String>,
        task_id: Option<String>,
        model: Option<String>,
    ) -> &Artifact {
        let hash = content_hash(content);
        let artifact_id = self
            .find_deleted_by_hash(&hash)
            .map(|p| self.by_path[p].artifact.artifact_id.clone())
            .unwrap_or_else(|| format!("{}:{}", Uuid::new_v4(), &hash[..12]));
        let now = Utc::now();
        let artifact = Artifact {
            artifact_id: artifact_id.clone(),
            path: path.to_string(),
            content_hash: hash.clone(),
            created_by_goal: goal_id.clone(),
            created_by_task: task_id.clone(),
            created_at: now,
            model,
            human_edited: false,
        };
        let edit = ArtifactEdit {
            edit_id: Uuid::new_v4().to_string(),
            artifact_id,
            goal_id,
            task_id,
            lines_added: count_lines(content),
            lines_removed: 0,
            edit_type: EditType::Create,
            source: EditSource::Sunwell,
            timestamp: now,
            content_hash: hash,
        };
        let lineage = ArtifactLineage {
            artifact,
            edits: vec![edit],
            imports: BTreeSet::new(),
            imported_by: BTreeSet::new(),
            deleted_at: None,
        };
        self.by_path.insert(path.to_string(), lineage);
        &self.by_path[path].artifact
    }

    pub fn record_edit(&mut self, path: &str, content: &[u8], edit: EditParams) -> Result<()> {
        let hash = content_hash(content);
        let lineage = self
            .by_path
            .get_mut(path)
            .ok_or_else(|| anyhow::anyhow!("no lineage recorded for {path}"))?;
        lineage.artifact.content_hash = hash.clone();
        if edit.source != EditSource::Sunwell {
            lineage.artifact.human_edited = true;
        }
        lineage.edits.push(ArtifactEdit {
            edit_id: Uuid::new_v4().to_string(),
            artifact_id: lineage.artifact.artifact_id.clone(),
            goal_id: edit.goal_id,
            task_id: edit.task_id,
            lines_added: edit.lines_added,
            lines_removed: edit.lines_removed,
            edit_type: EditType::Modify,
            source: edit.source,
            timestamp: Utc::now(),
            content_hash: hash,
        });
        Ok(())
    }

    pub fn record_rename(&mut self, from: &str, to: &str, goal_id: Option<String>, task_id: Option<String>) -> Result<()> {
        let mut lineage = self
            .by_path
            .remove(from)
            .ok_or_else(|| anyhow::anyhow!("no lineage recorded for {from}"))?;
        lineage.artifact.path = to.to_string();
        lineage.edits.push(ArtifactEdit {
            edit_id: Uuid::new_v4().to_string(),
            artifact_id: lineage.artifact.artifact_id.clone(),
            goal_id,
            task_id,
            lines_added: 0,
            lines_removed: 0,
            edit_type: EditType::Rename,
            source: EditSource::Sunwell,
            timestamp: Utc::now(),
            content_hash: lineage.artifact.content_hash.clone(),
        });
        for importer in lineage.imported_by.clone() {
            if let Some(other) = self.by_path.get_mut(&importer) {
                other.imports.remove(from);
                other.imports.insert(to.to_string());
            }
        }
        for imported in lineage.imports.clone() {
            if let Some(other) = self.by_path.get_mut(&imported) {
                other.imported_by.remove(from);
                other.imported_by.insert(to.to_string());
            }
        }
        self.by_path.insert(to.to_string(), lineage);
        Ok(())
    }

    pub fn record_delete(&mut self, path: &str, goal_id: Option<String>, task_id: Option<String>) -> Result<()> {
        let lineage = self
            .by_path
            .get_mut(path)
            .ok_or_else(|| anyhow::anyhow!("no lineage recorded for {path}"))?;
        let now = Utc::now();
        lineage.deleted_at = Some(now);
        lineage.edits.push(ArtifactEdit {
            edit_id: Uuid::new_v4().to_string(),
            artifact_id: lineage.artifact.artifact_id.clone(),
            goal_id,
            task_id,
            lines_added: 0,
            lines_removed: count_lines(b""),
            edit_type: EditType::Delete,
            source: EditSource::Sunwell,
            timestamp: now,
            content_hash: lineage.artifact.content_hash.clone(),
        });
        Ok(())
    }

    /// Replaces both forward and reverse edges for `path` atomically: every
    /// previous importee drops `path` from its `imported_by` before the new
    /// set is applied.
    pub fn update_imports(&mut self, path: &str, new_imports: BTreeSet<String>) -> Result<()> {
        let old_imports = self
            .by_path
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("no lineage recorded for {path}"))?
            .imports
            .clone();

        for stale in old_imports.difference(&new_imports) {
            if let Some(target) = self.by_path.get_mut(stale) {
                target.imported_by.remove(path);
            }
        }
        for fresh in new_imports.difference(&old_imports) {
            if let Some(target) = self.by_path.get_mut(fresh) {
                target.imported_by.insert(path.to_string());
            }
        }

        self.by_path.get_mut(path).unwrap().imports = new_imports;
        Ok(())
    }

    pub fn get_dependents(&self, path: &str) -> BTreeSet<String> {
        self.by_path.get(path).map(|l| l.imported_by.clone()).unwrap_or_default()
    }

    pub fn get_dependencies(&self, path: &str) -> BTreeSet<String> {
        self.by_path.get(path).map(|l| l.imports.clone()).unwrap_or_default()
    }

    /// Finds an existing deleted artifact whose last content hash matches,
    /// in deletion order. `record_create` consults this so a recreated file
    /// reuses identity rather than minting a new id for the same content;
    /// exposed publicly too for callers that want to check before creating.
    pub fn find_deleted_by_hash(&self, hash: &str) -> Option<&str> {
        self.by_path
            .values()
            .filter(|l| l.deleted_at.is_some() && l.artifact.content_hash == hash)
            .min_by_key(|l| l.deleted_at)
            .map(|l| l.artifact.path.as_str())
    }
}

fn count_lines(content: &[u8]) -> u64 {
    if content.is_empty() {
        0
    } else {
        String::from_utf8_lossy(content).lines().count() as u64
    }
}
