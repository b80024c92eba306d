use crate::error::Result;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

const SCHEMA_SUFFIX: &str = ".schema.yaml";

/// A change to one collection, ready for `Store::apply_watcher_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub collection: String,
    pub kind: ChangeKind,
}

/// The kind of file change detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Watches the data directory for collection files and schema sidecars
/// changed by other processes. Debounced events are sent through an mpsc
/// channel.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    /// Handle to the background thread processing events
    _thread: std::thread::JoinHandle<()>,
    /// Receiver for debounced collection change events
    pub event_rx: mpsc::Receiver<WatcherEvent>,
}

impl FileWatcher {
    /// Start watching `data_dir` for `<name>.<extension>` and
    /// `<name>.schema.yaml` files. Events are debounced (100ms) per
    /// collection, keeping the last change kind.
    pub fn start(data_dir: &Path, extension: &str) -> Result<Self> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();
        let (event_tx, event_rx) = mpsc::channel::<WatcherEvent>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(data_dir, RecursiveMode::NonRecursive)?;

        let suffix = format!(".{extension}");
        let thread = std::thread::spawn(move || {
            let debounce = Duration::from_millis(100);
            let mut pending: HashMap<String, ChangeKind> = HashMap::new();
            let mut last_event = Instant::now();

            loop {
                match notify_rx.recv_timeout(debounce) {
                    Ok(Ok(event)) => {
                        let kind = match event.kind {
                            EventKind::Create(_) => ChangeKind::Created,
                            EventKind::Modify(_) => ChangeKind::Modified,
                            EventKind::Remove(_) => ChangeKind::Deleted,
                            _ => continue,
                        };
                        for path in &event.paths {
                            if let Some(collection) = collection_for_path(path, &suffix) {
                                pending.insert(collection, kind);
                            }
                        }
                        last_event = Instant::now();
                    }
                    Ok(Err(e)) => {
                        log::warn!("File watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() && last_event.elapsed() >= debounce {
                            for (collection, kind) in pending.drain() {
                                if event_tx.send(WatcherEvent { collection, kind }).is_err() {
                                    return; // Receiver dropped
                                }
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(FileWatcher {
            _watcher: watcher,
            _thread: thread,
            event_rx,
        })
    }
}

/// Collection a changed path belongs to. Hidden files (including the
/// temporary files of an in-flight rewrite) belong to none.
fn collection_for_path(path: &Path, suffix: &str) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    if file_name.starts_with('.') {
        return None;
    }
    let name = file_name
        .strip_suffix(SCHEMA_SUFFIX)
        .or_else(|| file_name.strip_suffix(suffix))?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
