use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use sner_core::errors::SnerResult;
use sner_core::netutils;

/// Rate-limit heatmap: per-bucket count of in-flight targets. Process-local
/// state shared across scheduler calls; the JSON file only provides restart
/// continuity (best effort).
pub struct Heatmap {
    path: PathBuf,
    hot_level: i64,
    map: HashMap<String, i64>,
}

impl Heatmap {
    /// Load persisted state from `<var_dir>/heatmap.json`; a malformed file
    /// degrades to an empty map.
    pub fn load(var_dir: &Path, hot_level: i64) -> Self {
        let path = var_dir.join("heatmap.json");
        let map = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(map) => map,
                Err(err) => {
                    warn!("malformed heatmap file {}: {}", path.display(), err);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            hot_level,
            map,
        }
    }

    /// Rate-limit bucket key for a target.
    pub fn hashval(value: &str) -> String {
        netutils::hashval(value)
    }

    /// Warm a bucket; returns the new count.
    pub fn put(&mut self, value: &str) -> i64 {
        let count = self.map.entry(value.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Cool a bucket; zero-count entries are pruned.
    pub fn pop(&mut self, value: &str) -> i64 {
        match self.map.get_mut(value) {
            Some(count) => {
                *count -= 1;
                let current = *count;
                if current <= 0 {
                    self.map.remove(value);
                }
                current
            }
            None => 0,
        }
    }

    /// A bucket is hot when its count reached the hot level; level 0
    /// disables rate-limiting entirely.
    pub fn is_hot(&self, value: &str) -> bool {
        self.hot_level > 0 && self.map.get(value).copied().unwrap_or(0) >= self.hot_level
    }

    /// Drop any zero or negative entries.
    pub fn gc(&mut self) {
        self.map.retain(|_, count| *count > 0);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total(&self) -> i64 {
        self.map.values().sum()
    }

    /// Persist atomically (write + rename).
    pub fn save(&self) -> SnerResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_vec(&self.map)?)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_pop_prunes_zero_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = Heatmap::load(dir.path(), 2);

        assert_eq!(heatmap.put("127.0.0.0/24"), 1);
        assert_eq!(heatmap.put("127.0.0.0/24"), 2);
        assert_eq!(heatmap.pop("127.0.0.0/24"), 1);
        assert_eq!(heatmap.pop("127.0.0.0/24"), 0);
        assert!(heatmap.is_empty());

        // pop of an unknown bucket is a no-op
        assert_eq!(heatmap.pop("10.0.0.0/24"), 0);
        assert!(heatmap.is_empty());
    }

    #[test]
    fn hot_level_zero_disables_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = Heatmap::load(dir.path(), 0);
        for _ in 0..100 {
            heatmap.put("127.0.0.0/24");
        }
        assert!(!heatmap.is_hot("127.0.0.0/24"));
    }

    #[test]
    fn hot_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = Heatmap::load(dir.path(), 1);
        assert!(!heatmap.is_hot("127.0.0.0/24"));
        heatmap.put("127.0.0.0/24");
        assert!(heatmap.is_hot("127.0.0.0/24"));
        heatmap.pop("127.0.0.0/24");
        assert!(!heatmap.is_hot("127.0.0.0/24"));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut heatmap = Heatmap::load(dir.path(), 1);
        heatmap.put("127.0.0.0/24");
        heatmap.put("127.0.0.0/24");
        heatmap.save().unwrap();

        let reloaded = Heatmap::load(dir.path(), 1);
        assert_eq!(reloaded.total(), 2);
        assert!(reloaded.is_hot("127.0.0.0/24"));
    }

    #[test]
    fn malformed_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("heatmap.json"), b"not json").unwrap();
        let heatmap = Heatmap::load(dir.path(), 1);
        assert!(heatmap.is_empty());
    }
}
