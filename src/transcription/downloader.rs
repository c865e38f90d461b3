//! Model cache warm-up for `ramble download-models`.
//!
//! Fetches all five sizes into the cache directory ahead of time so the
//! first request for a size does not pay the download.

use crate::transcription::model::{self, ModelSize};
use std::path::Path;
use std::time::Instant;

/// What happened to one model size.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    AlreadyCached,
    Downloaded { seconds: f64 },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub entries: Vec<(ModelSize, DownloadOutcome)>,
}

impl DownloadReport {
    pub fn failures(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DownloadOutcome::Failed(_)))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }

    /// One line per size, as printed by the CLI.
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(size, outcome)| match outcome {
                DownloadOutcome::AlreadyCached => format!("{}: already cached", size),
                DownloadOutcome::Downloaded { seconds } => {
                    format!("{}: downloaded in {:.1}s ({} VRAM)", size, seconds, size.vram())
                }
                DownloadOutcome::Failed(reason) => format!("{}: FAILED - {}", size, reason),
            })
            .collect()
    }
}

/// Download every model size into `cache_dir`.
///
/// A failure for one size is recorded and the remaining sizes still run.
pub async fn download_models(cache_dir: &Path) -> DownloadReport {
    download_sizes(&ModelSize::ALL, cache_dir).await
}

pub async fn download_sizes(sizes: &[ModelSize], cache_dir: &Path) -> DownloadReport {
    let mut entries = Vec::with_capacity(sizes.len());

    for &size in sizes {
        if model::cached_model_files(size, cache_dir).is_some() {
            tracing::info!("{}: already cached", size);
            entries.push((size, DownloadOutcome::AlreadyCached));
            continue;
        }

        tracing::info!("{}: downloading {}", size, size.repo_name());
        let start = Instant::now();
        let outcome = match model::fetch_model_files(size, cache_dir).await {
            Ok(_) => DownloadOutcome::Downloaded {
                seconds: start.elapsed().as_secs_f64(),
            },
            Err(e) => {
                tracing::error!("{}: download failed: {:#}", size, e);
                DownloadOutcome::Failed(format!("{:#}", e))
            }
        };
        entries.push((size, outcome));
    }

    DownloadReport { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn seed_cache(dir: &Path, size: ModelSize) {
        let repo_dir = dir.join(format!("models--{}", size.repo_name().replace('/', "--")));
        let snapshot = repo_dir.join("snapshots").join("abc123");
        fs::create_dir_all(repo_dir.join("refs")).unwrap();
        fs::create_dir_all(&snapshot).unwrap();
        fs::write(repo_dir.join("refs").join("main"), "abc123").unwrap();
        for file in model::MODEL_FILES {
            fs::write(snapshot.join(file), b"{}").unwrap();
        }
    }

    #[tokio::test]
    async fn test_cached_sizes_are_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path(), ModelSize::Tiny);

        let report = download_sizes(&[ModelSize::Tiny], dir.path()).await;
        assert_eq!(report.entries, vec![(ModelSize::Tiny, DownloadOutcome::AlreadyCached)]);
        assert!(report.is_success());
        assert_eq!(report.lines(), vec!["tiny: already cached".to_string()]);
    }

    #[test]
    fn test_report_counts_failures() {
        let report = DownloadReport {
            entries: vec![
                (ModelSize::Tiny, DownloadOutcome::AlreadyCached),
                (ModelSize::Base, DownloadOutcome::Downloaded { seconds: 1.5 }),
                (ModelSize::Small, DownloadOutcome::Failed("offline".to_string())),
            ],
        };
        assert_eq!(report.failures(), 1);
        assert!(!report.is_success());
        assert_eq!(report.lines()[1], "base: downloaded in 1.5s (1GB VRAM)");
        assert_eq!(report.lines()[2], "small: FAILED - offline");
    }
}
