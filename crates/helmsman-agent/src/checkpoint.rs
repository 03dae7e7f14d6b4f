//! Crash-recovery checkpoints.
//!
//! A snapshot of the iteration state is written every N iterations; the
//! newest K are retained. Restoration is best-effort and idempotent —
//! a failed restore leaves the live engine untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use helmsman_core::{FailureSignal, Message, WorkspaceFs};

use crate::context::TokenTotals;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub iteration: usize,
    /// Saved state name, kept for diagnostics. Restore always re-enters
    /// the reasoning state regardless.
    pub state: String,
    pub messages: Vec<Message>,
    pub token_usage: TokenTotals,
    pub task_plan: String,
    pub findings: String,
    pub progress: String,
    pub failure_history: Vec<FailureSignal>,
    pub created_at: DateTime<Utc>,
}

/// Ordered ids of retained checkpoints, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    ids: Vec<String>,
}

pub struct CheckpointManager {
    fs: Arc<dyn WorkspaceFs>,
    session_id: String,
    save_interval: usize,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(
        fs: Arc<dyn WorkspaceFs>,
        session_id: &str,
        save_interval: usize,
        max_checkpoints: usize,
    ) -> Self {
        Self {
            fs,
            session_id: session_id.to_string(),
            save_interval,
            max_checkpoints,
        }
    }

    fn index_path(&self) -> String {
        format!("sessions/{}/checkpoints/index.json", self.session_id)
    }

    fn blob_path(&self, id: &str) -> String {
        format!("sessions/{}/checkpoints/{}.json", self.session_id, id)
    }

    fn load_index(&self) -> CheckpointIndex {
        if !self.fs.exists(&self.index_path()) {
            return CheckpointIndex::default();
        }
        self.fs
            .read(&self.index_path())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn store_index(&self, index: &CheckpointIndex) {
        if let Ok(raw) = serde_json::to_string(index) {
            if let Err(e) = self.fs.write(&self.index_path(), &raw) {
                tracing::error!("failed to write checkpoint index: {}", e);
            }
        }
    }

    /// True every `save_interval` iterations.
    pub fn should_save(&self, iteration: usize) -> bool {
        iteration > 0 && iteration % self.save_interval == 0
    }

    /// Write a checkpoint and evict the oldest beyond the retention cap.
    /// Eviction drops ids from the index; the index is the authoritative
    /// retained set.
    #[allow(clippy::too_many_arguments)]
    pub fn save_checkpoint(
        &self,
        iteration: usize,
        state: &str,
        messages: Vec<Message>,
        token_usage: TokenTotals,
        task_plan: String,
        findings: String,
        progress: String,
        failure_history: Vec<FailureSignal>,
    ) -> Option<String> {
        let id = format!(
            "ckpt_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let checkpoint = Checkpoint {
            id: id.clone(),
            iteration,
            state: state.to_string(),
            messages,
            token_usage,
            task_plan,
            findings,
            progress,
            failure_history,
            created_at: Utc::now(),
        };

        let raw = match serde_json::to_string(&checkpoint) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("failed to serialize checkpoint: {}", e);
                return None;
            }
        };
        if let Err(e) = self.fs.write(&self.blob_path(&id), &raw) {
            tracing::error!("failed to write checkpoint: {}", e);
            return None;
        }

        let mut index = self.load_index();
        index.ids.push(id.clone());
        while index.ids.len() > self.max_checkpoints {
            let evicted = index.ids.remove(0);
            tracing::debug!("checkpoint evicted: {}", evicted);
        }
        self.store_index(&index);

        tracing::info!("checkpoint saved: {} (iteration {})", id, iteration);
        Some(id)
    }

    /// The most recent retained checkpoint, or none.
    pub fn get_latest_checkpoint(&self) -> Option<Checkpoint> {
        let index = self.load_index();
        let id = index.ids.last()?;
        let raw = self.fs.read(&self.blob_path(id)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::error!("failed to parse checkpoint {}: {}", id, e);
                None
            }
        }
    }

    pub fn retained_count(&self) -> usize {
        self.load_index().ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsman_core::MemoryFs;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryFs::new()), "s1", 5, 3)
    }

    fn save(manager: &CheckpointManager, iteration: usize) -> String {
        manager
            .save_checkpoint(
                iteration,
                "reasoning",
                vec![Message::user("hi")],
                TokenTotals {
                    input: 10,
                    output: 5,
                },
                String::new(),
                String::new(),
                String::new(),
                Vec::new(),
            )
            .expect("save")
    }

    #[test]
    fn test_should_save_every_interval() {
        let manager = manager();
        assert!(!manager.should_save(0));
        assert!(!manager.should_save(4));
        assert!(manager.should_save(5));
        assert!(manager.should_save(10));
    }

    #[test]
    fn test_retention_cap_and_latest() {
        let manager = manager();
        for i in 1..=5 {
            save(&manager, i * 5);
        }
        assert_eq!(manager.retained_count(), 3);
        let latest = manager.get_latest_checkpoint().expect("latest");
        // The latest retrievable checkpoint has the greatest iteration.
        assert_eq!(latest.iteration, 25);
    }

    #[test]
    fn test_restore_round_trip() {
        let manager = manager();
        let id = save(&manager, 5);
        let restored = manager.get_latest_checkpoint().expect("latest");
        assert_eq!(restored.id, id);
        assert_eq!(restored.messages.len(), 1);
        assert_eq!(restored.token_usage.input, 10);
        assert_eq!(restored.state, "reasoning");
    }

    #[test]
    fn test_no_checkpoint_returns_none() {
        assert!(manager().get_latest_checkpoint().is_none());
    }
}
