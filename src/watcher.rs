//! Feeds file names from `incoming/` to the worker pool
//!
//! Two sources, one sink:
//!
//! ```text
//! notify (inotify / FSEvents) ──┐
//!                               ├──→ Offerer ──→ bounded work channel ──→ workers
//! reconcile (list incoming/) ───┘      │
//!                                      └── InFlight set (no double offers)
//! ```
//!
//! Notifications are only a latency optimization: they can be missed, and a
//! full channel drops offers. The periodic reconcile re-lists the directory
//! and catches everything they lose.

use crate::pipeline::InFlight;
use crate::queue::{is_queue_file, QueueError, QueueLayout, QueueState};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;

/// Hands names to the work channel, at most once while in flight
#[derive(Clone)]
pub struct Offerer {
    tx: SyncSender<String>,
    in_flight: Arc<InFlight>,
}

impl Offerer {
    pub fn new(tx: SyncSender<String>, in_flight: Arc<InFlight>) -> Self {
        Self { tx, in_flight }
    }

    /// Offer one file name; false if skipped, already in flight or dropped
    pub fn offer(&self, name: &str) -> bool {
        if !is_queue_file(name) || !self.in_flight.insert(name) {
            return false;
        }
        match self.tx.try_send(name.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                // Picked up again by the next reconcile
                self.in_flight.remove(name);
                tracing::trace!(file = name, "Work queue full, offer dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.remove(name);
                false
            }
        }
    }
}

/// Offer every file currently in `incoming/`, in name (= sequence) order
pub fn reconcile(layout: &QueueLayout, offerer: &Offerer) -> Result<usize, QueueError> {
    let offered = layout
        .list(QueueState::Incoming)?
        .iter()
        .filter(|name| offerer.offer(name))
        .count();
    if offered > 0 {
        tracing::debug!("Reconcile offered {} file(s)", offered);
    }
    Ok(offered)
}

/// OS notifications on `incoming/`; dropping it stops them
pub struct IncomingWatcher {
    _watcher: RecommendedWatcher,
}

impl IncomingWatcher {
    pub fn start(layout: &QueueLayout, offerer: Offerer) -> notify::Result<Self> {
        let incoming = layout.dir(QueueState::Incoming);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for name in arrivals(&event) {
                    offerer.offer(name);
                }
            }
            Err(e) => tracing::warn!("Watcher error: {}", e),
        })?;
        watcher.watch(&incoming, RecursiveMode::NonRecursive)?;
        tracing::debug!("Watching {}", incoming.display());
        Ok(Self { _watcher: watcher })
    }
}

/// Names that just appeared in incoming/
///
/// Producers rename into the directory; depending on the backend that shows
/// up as a create, a rename-to, or a paired rename whose last path is the
/// destination. A rename-from is a worker claiming the file away and is
/// ignored. Backends that cannot tell the sides apart report `Any`, so the
/// path has to still exist.
fn arrivals(event: &Event) -> Vec<&str> {
    let paths: Vec<&Path> = match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| p.as_path()).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().map(|p| p.as_path()).into_iter().collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event
            .paths
            .iter()
            .filter(|p| p.exists())
            .map(|p| p.as_path())
            .collect(),
        _ => Vec::new(),
    };
    paths.into_iter().filter_map(file_name).collect()
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventEnvelope, EventPayload, SessionStarted};
    use crate::queue::QueueWriter;
    use notify::event::{CreateKind, RemoveKind};
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Duration;

    fn setup(capacity: usize) -> (tempfile::TempDir, QueueWriter, Offerer, mpsc::Receiver<String>, Arc<InFlight>) {
        let dir = tempfile::tempdir().unwrap();
        let writer = QueueWriter::new(QueueLayout::new(dir.path())).unwrap();
        let (tx, rx) = mpsc::sync_channel(capacity);
        let in_flight = Arc::new(InFlight::new());
        (dir, writer, Offerer::new(tx, in_flight.clone()), rx, in_flight)
    }

    fn started(session: &str) -> EventEnvelope {
        EventEnvelope::new(session, EventPayload::SessionStarted(SessionStarted::default()))
    }

    #[test]
    fn test_offer_filters_and_deduplicates() {
        let (_dir, _writer, offerer, rx, in_flight) = setup(8);
        assert!(!offerer.offer("x.json.error.json"));
        assert!(!offerer.offer(".tmpAbc"));
        assert!(offerer.offer("1-s-session_started-e.json"));
        assert!(!offerer.offer("1-s-session_started-e.json"));

        assert_eq!(rx.try_recv().unwrap(), "1-s-session_started-e.json");
        assert!(in_flight.contains("1-s-session_started-e.json"));
    }

    #[test]
    fn test_full_channel_drops_and_forgets() {
        let (_dir, _writer, offerer, _rx, in_flight) = setup(1);
        assert!(offerer.offer("1-s-session_started-a.json"));
        assert!(!offerer.offer("2-s-session_started-b.json"));
        // Not marked in flight, so reconcile can offer it again
        assert!(!in_flight.contains("2-s-session_started-b.json"));
    }

    #[test]
    fn test_reconcile_offers_in_sequence_order() {
        let (_dir, writer, offerer, rx, _in_flight) = setup(8);
        let mut written = Vec::new();
        for session in ["a", "b", "c"] {
            let path = writer.write(&started(session)).unwrap();
            written.push(path.file_name().unwrap().to_str().unwrap().to_string());
        }

        assert_eq!(reconcile(writer.layout(), &offerer).unwrap(), 3);
        let received: Vec<String> = rx.try_iter().collect();
        assert_eq!(received, written);

        // Nothing new while they are still in flight
        assert_eq!(reconcile(writer.layout(), &offerer).unwrap(), 0);
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_arrivals_by_kind() {
        let created = event(EventKind::Create(CreateKind::File), &["/q/incoming/1-s-session_started-a.json"]);
        assert_eq!(arrivals(&created), vec!["1-s-session_started-a.json"]);

        let renamed_to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/q/incoming/2-s-session_started-b.json"],
        );
        assert_eq!(arrivals(&renamed_to), vec!["2-s-session_started-b.json"]);

        let both = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/q/tmp/.tmpXYZ", "/q/incoming/3-s-session_started-c.json"],
        );
        assert_eq!(arrivals(&both), vec!["3-s-session_started-c.json"]);

        let removed = event(EventKind::Remove(RemoveKind::File), &["/q/incoming/4-s-session_started-d.json"]);
        assert!(arrivals(&removed).is_empty());
    }

    #[test]
    fn test_claim_rename_is_not_an_arrival() {
        let claimed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/q/incoming/5-s-session_started-e.json"],
        );
        assert!(arrivals(&claimed).is_empty());

        // Ambiguous renames only count when the file is still there
        let (_dir, writer, _offerer, _rx, _in_flight) = setup(1);
        let present = writer.write(&started("p")).unwrap();
        let gone = writer.layout().path(QueueState::Incoming, "6-s-session_started-f.json");
        let any = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(present.clone())
            .add_path(gone);
        assert_eq!(arrivals(&any), vec![file_name(&present).unwrap()]);
    }

    #[test]
    fn test_watcher_sees_new_file() {
        let (_dir, writer, offerer, rx, _in_flight) = setup(8);
        let _watcher = match IncomingWatcher::start(writer.layout(), offerer) {
            Ok(w) => w,
            // No notification backend in this environment; reconcile covers it
            Err(_) => return,
        };

        let path = writer.write(&started("w")).unwrap();
        let expected = path.file_name().unwrap().to_str().unwrap().to_string();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, expected);
    }
}
