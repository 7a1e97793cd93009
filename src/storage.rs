//! Result persistence.
//!
//! A [`ResultSink`] receives a finished [`SweepResult`]. It can save it under
//! a destination directory, or hand it back to whoever is driving the sweep.
//!
//! - [`JsonFileSink`]: pretty-printed JSON files, one per run
//! - [`MemorySink`]: keeps everything in memory (tests, embedding)
//!
//! The JSON record round-trips losslessly through `serde_json`.

use crate::error::{SweepError, SweepResultOf};
use crate::procedures::SweepResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Destination for finished sweep results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist `result` under `destination`; returns the path written.
    async fn save(
        &self,
        result: &SweepResult,
        destination: &Path,
        file_stem: &str,
    ) -> SweepResultOf<PathBuf>;

    /// Hand `result` back to the caller for interactive use.
    async fn export_to_caller(&self, result: &SweepResult) -> SweepResultOf<()>;
}

/// File name for a result: `<stem>_<YYYYmmdd_HHMMSS>_beam<N>.json`.
pub fn result_file_name(result: &SweepResult, file_stem: &str) -> String {
    format!(
        "{}_{}_beam{}.json",
        file_stem,
        result.timestamp.format("%Y%m%d_%H%M%S"),
        result.beam_index
    )
}

fn check_stem(file_stem: &str) -> SweepResultOf<()> {
    if file_stem.is_empty() || file_stem.contains(['/', '\\']) {
        return Err(SweepError::Storage(format!(
            "invalid file stem '{file_stem}'"
        )));
    }
    Ok(())
}

// =============================================================================
// JsonFileSink
// =============================================================================

/// Writes results as JSON files.
pub struct JsonFileSink {
    exported_tx: watch::Sender<Option<SweepResult>>,
}

impl Default for JsonFileSink {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonFileSink {
    pub fn new() -> Self {
        let (exported_tx, _rx) = watch::channel(None);
        Self { exported_tx }
    }

    /// Receiver for results passed to [`ResultSink::export_to_caller`].
    pub fn exported(&self) -> watch::Receiver<Option<SweepResult>> {
        self.exported_tx.subscribe()
    }

    /// Load a result previously written by [`ResultSink::save`].
    pub async fn load(path: &Path) -> SweepResultOf<SweepResult> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            SweepError::Storage(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn save(
        &self,
        result: &SweepResult,
        destination: &Path,
        file_stem: &str,
    ) -> SweepResultOf<PathBuf> {
        check_stem(file_stem)?;
        tokio::fs::create_dir_all(destination).await?;

        let path = destination.join(result_file_name(result, file_stem));
        let json = serde_json::to_vec_pretty(result)?;
        tokio::fs::write(&path, json).await?;

        info!(path = %path.display(), run_id = %result.run_id, "Saved sweep result");
        Ok(path)
    }

    async fn export_to_caller(&self, result: &SweepResult) -> SweepResultOf<()> {
        self.exported_tx.send_replace(Some(result.clone()));
        Ok(())
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Keeps saved and exported results in memory.
#[derive(Default)]
pub struct MemorySink {
    saved: Mutex<BTreeMap<PathBuf, String>>,
    exported: Mutex<Vec<SweepResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialize the record stored at `path`.
    pub async fn load(&self, path: &Path) -> SweepResultOf<SweepResult> {
        let saved = self.saved.lock().await;
        let json = saved
            .get(path)
            .ok_or_else(|| SweepError::Storage(format!("nothing saved at {}", path.display())))?;
        Ok(serde_json::from_str(json)?)
    }

    pub async fn saved_paths(&self) -> Vec<PathBuf> {
        self.saved.lock().await.keys().cloned().collect()
    }

    pub async fn exported(&self) -> Vec<SweepResult> {
        self.exported.lock().await.clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn save(
        &self,
        result: &SweepResult,
        destination: &Path,
        file_stem: &str,
    ) -> SweepResultOf<PathBuf> {
        check_stem(file_stem)?;
        let path = destination.join(result_file_name(result, file_stem));
        let json = serde_json::to_string(result)?;
        self.saved.lock().await.insert(path.clone(), json);
        Ok(path)
    }

    async fn export_to_caller(&self, result: &SweepResult) -> SweepResultOf<()> {
        self.exported.lock().await.push(result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedures::SweepConfiguration;

    fn fitted_result() -> SweepResult {
        let config = SweepConfiguration {
            num_steps: 3,
            sample_reps: 2,
            beam_index: 1,
            ..Default::default()
        };
        let mut result = SweepResult::new(&config, 920.0);
        result.push_row(vec![2.1, 1.9], 0.0);
        result.push_row(vec![52.4, 52.6], 50.0);
        result.push_row(vec![107.0, 106.9], 100.0);
        result.apply_fit().unwrap();
        result
    }

    #[test]
    fn test_file_name_format() {
        let result = fitted_result();
        let name = result_file_name(&result, "power_cal");
        assert!(name.starts_with("power_cal_"));
        assert!(name.ends_with("_beam1.json"));
    }

    #[tokio::test]
    async fn test_memory_sink_round_trip() {
        let sink = MemorySink::new();
        let result = fitted_result();

        let path = sink.save(&result, Path::new("/data"), "cal").await.unwrap();
        assert!(path.starts_with("/data"));
        assert_eq!(sink.load(&path).await.unwrap(), result);

        sink.export_to_caller(&result).await.unwrap();
        assert_eq!(sink.exported().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_in_stem() {
        let sink = MemorySink::new();
        let err = sink
            .save(&fitted_result(), Path::new("/data"), "../escape")
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::Storage(_)));
    }

    #[tokio::test]
    async fn test_json_sink_export_is_observable() {
        let sink = JsonFileSink::new();
        let rx = sink.exported();
        let result = fitted_result();

        sink.export_to_caller(&result).await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|r| r.run_id), Some(result.run_id));
    }
}
