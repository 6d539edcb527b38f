//! One-shot build: compile the whole source tree and upload every artifact.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::ProgressBar;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::error::SyncError;
use crate::queue::RequestQueue;
use crate::role::FileDescriptor;
use crate::stats::{BuildStats, QueueSummary};
use crate::transform::{CompiledArtifact, Transforms};

/// A file whose transform failed during the build
#[derive(Debug)]
pub struct BuildFailure {
    pub path: PathBuf,
    pub error: SyncError,
}

/// Result of the parallel compile phase
#[derive(Debug, Default)]
pub struct Compiled {
    pub artifacts: Vec<CompiledArtifact>,
    pub failures: Vec<BuildFailure>,
}

impl Compiled {
    pub fn has_failure(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Classify scanned files into the descriptors to build.
///
/// Unclassified files are skipped. Descriptors sharing an output path
/// (stylesheet partials, sprite members) collapse into the first one seen.
/// Returns the descriptors and the number of skipped files
pub fn plan(classifier: &Classifier, files: &[PathBuf]) -> (Vec<FileDescriptor>, usize) {
    let mut seen = HashSet::new();
    let mut descriptors = Vec::new();
    let mut skipped = 0;

    for path in files {
        match classifier.classify(path) {
            Ok(descriptor) => {
                if seen.insert(descriptor.output_path.clone()) {
                    descriptors.push(descriptor);
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping file");
                skipped += 1;
            }
        }
    }

    (descriptors, skipped)
}

/// Transform and write every descriptor in parallel
pub fn compile(
    transforms: &Transforms,
    descriptors: &[FileDescriptor],
    shutdown: &AtomicBool,
    stats: &BuildStats,
    progress: Option<&ProgressBar>,
) -> Result<Compiled, SyncError> {
    let results: Vec<_> = descriptors
        .par_iter()
        .filter_map(|descriptor| {
            if shutdown.load(Ordering::Relaxed) {
                return None;
            }

            let result = transforms.run(descriptor);
            match &result {
                Ok(artifact) => {
                    stats.files_written.add(1);
                    stats.bytes_written.add(artifact.bytes.len() as u64);
                }
                Err(e) => {
                    stats.errors.add(1);
                    warn!(path = %descriptor.source_path.display(), error = %e, "transform failed");
                }
            }

            if let Some(pb) = progress {
                pb.inc(1);
            }

            Some((descriptor.source_path.clone(), result))
        })
        .collect();

    if shutdown.load(Ordering::Relaxed) {
        return Err(SyncError::Cancelled);
    }

    let mut compiled = Compiled::default();
    for (path, result) in results {
        match result {
            Ok(artifact) => compiled.artifacts.push(artifact),
            Err(error) => compiled.failures.push(BuildFailure { path, error }),
        }
    }

    Ok(compiled)
}

/// Enqueue one upsert per artifact per destination, then drain the queue
pub async fn upload(queue: RequestQueue, artifacts: &[CompiledArtifact]) -> QueueSummary {
    for artifact in artifacts {
        // Outcomes are counted by the queue stats; tickets are not awaited
        let _ = queue.broadcast(artifact.request());
    }
    queue.drain().await
}

/// Exit code for a finished build: 0 = ok, 1 = partial failure, 2 = nothing succeeded
pub fn exit_code(compiled: &Compiled, summary: &QueueSummary, destinations: usize) -> u8 {
    let has_failure = compiled.has_failure() || summary.failed > 0;
    let has_success = if destinations == 0 {
        !compiled.artifacts.is_empty()
    } else {
        summary.delivered > 0
    };

    if has_failure && !has_success {
        2
    } else if has_failure {
        1
    } else {
        0
    }
}
