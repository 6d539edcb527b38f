//! Polling filesystem watcher feeding the classify -> dispatch pipeline.
//!
//! Two `notify::PollWatcher`s share the configured roots: one polls text
//! sources at `watcher.interval_ms`, the other polls binary files (images,
//! fonts, media) at the slower `watcher.binary_interval_ms`. Raw events land
//! on one channel and are processed strictly one at a time: an event's full
//! classify -> transform -> enqueue cycle is awaited before the next starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config as NotifyConfig, PollWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::SyncError;
use crate::files::{is_binary, is_ignored};
use crate::role::{EventKind, RawEventKind, TransformEvent};
use crate::stats::QueueSummary;

/// One processed filesystem event, handed to the `on_transformed` callback
#[derive(Debug)]
pub struct WatchReport {
    pub path: PathBuf,
    pub raw: RawEventKind,
    /// Derived event kind; `None` when the path could not be classified
    pub kind: Option<EventKind>,
    pub outcome: Result<DispatchOutcome, SyncError>,
}

/// Stops a running [`Watcher`]. Cloneable and callable from any thread
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

#[derive(Debug)]
struct RawChange {
    path: PathBuf,
    kind: RawEventKind,
}

/// Map a notify event kind to a raw change. Access and unknown events are dropped
pub fn raw_kind(kind: &notify::EventKind) -> Option<RawEventKind> {
    match kind {
        notify::EventKind::Create(CreateKind::Folder) => None,
        notify::EventKind::Create(_) => Some(RawEventKind::Add),
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(RawEventKind::Unlink),
        notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(RawEventKind::Add),
        notify::EventKind::Modify(_) => Some(RawEventKind::Change),
        notify::EventKind::Remove(RemoveKind::Folder) => None,
        notify::EventKind::Remove(_) => Some(RawEventKind::Unlink),
        notify::EventKind::Access(_) | notify::EventKind::Any | notify::EventKind::Other => None,
    }
}

/// Whether the watcher polling `binary` files should report `path`
pub fn accepts(path: &Path, binary: bool) -> bool {
    !is_ignored(path) && !path.is_dir() && is_binary(path) == binary
}

/// Long-running watch loop. Owns the classifier and the dispatcher
pub struct Watcher {
    classifier: Classifier,
    dispatcher: Dispatcher,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(classifier: Classifier, dispatcher: Dispatcher) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            classifier,
            dispatcher,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Classify one raw change and await its dispatch
    pub async fn process(&self, path: &Path, raw: RawEventKind) -> WatchReport {
        process(&self.classifier, &self.dispatcher, path, raw).await
    }

    /// Watch until the stop handle fires, then unsubscribe and drain the queue
    pub async fn run<F>(self, on_transformed: F) -> Result<QueueSummary, SyncError>
    where
        F: Fn(WatchReport),
    {
        let Self {
            classifier,
            dispatcher,
            mut stop_rx,
            ..
        } = self;
        let config = classifier.config();

        let (tx, mut rx) = mpsc::unbounded_channel::<RawChange>();
        let text = poll_watcher(tx.clone(), config.watcher.interval(), false)?;
        let binary = poll_watcher(tx, config.watcher.binary_interval(), true)?;
        let mut watchers = [text, binary];

        for root in &config.watch {
            for watcher in watchers.iter_mut() {
                if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                    warn!(root = %root.display(), error = %e, "cannot watch root");
                }
            }
        }

        info!(
            roots = config.watch.len(),
            interval_ms = config.watcher.interval_ms,
            binary_interval_ms = config.watcher.binary_interval_ms,
            "watching for changes"
        );

        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                change = rx.recv() => match change {
                    Some(change) => {
                        let report =
                            process(&classifier, &dispatcher, &change.path, change.kind).await;
                        on_transformed(report);
                    }
                    None => break,
                },
            }
        }

        // Dropping the watchers unsubscribes from every root
        drop(watchers);
        info!("watcher stopped, draining delivery queue");

        Ok(dispatcher.drain().await)
    }
}

fn poll_watcher(
    tx: mpsc::UnboundedSender<RawChange>,
    interval: Duration,
    binary: bool,
) -> Result<PollWatcher, SyncError> {
    let handler = move |result: notify::Result<notify::Event>| match result {
        Ok(event) => {
            let Some(kind) = raw_kind(&event.kind) else {
                return;
            };
            for path in event.paths {
                if accepts(&path, binary) {
                    // Receiver gone means the watch loop has ended
                    let _ = tx.send(RawChange { path, kind });
                }
            }
        }
        Err(e) => warn!(error = %e, "watch error"),
    };

    PollWatcher::new(handler, NotifyConfig::default().with_poll_interval(interval))
        .map_err(|source| SyncError::Watch { source })
}

async fn process(
    classifier: &Classifier,
    dispatcher: &Dispatcher,
    path: &Path,
    raw: RawEventKind,
) -> WatchReport {
    debug!(path = %path.display(), event = raw.as_str(), "filesystem event");

    match classifier.classify(path) {
        Ok(descriptor) => {
            let event = TransformEvent::from_raw(raw, descriptor);
            let kind = event.kind;
            let outcome = dispatcher.dispatch(event).await;
            WatchReport {
                path: path.to_path_buf(),
                raw,
                kind: Some(kind),
                outcome: Ok(outcome),
            }
        }
        Err(error) => {
            warn!(path = %path.display(), error = %error, "skipping file");
            WatchReport {
                path: path.to_path_buf(),
                raw,
                kind: None,
                outcome: Err(error),
            }
        }
    }
}
