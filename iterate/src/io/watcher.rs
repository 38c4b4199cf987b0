//! Debounced observer of the workspace status snapshot.
//!
//! Filesystem notifications only reset a timer; the snapshot is read when the
//! timer fires, so a burst of rewrites produces one event carrying the last
//! content.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::status::try_read_status;
use crate::core::settings::WatchSettings;
use crate::core::snapshot::{ChangeFilter, StatusDelta, StatusSnapshot};

/// One observed change to the status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangedEvent {
    /// `None` only for the first snapshot observed by this watcher.
    pub previous: Option<StatusSnapshot>,
    pub current: StatusSnapshot,
    pub delta: StatusDelta,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub debounce: Duration,
    pub filter: ChangeFilter,
}

impl From<&WatchSettings> for WatchOptions {
    fn from(settings: &WatchSettings) -> Self {
        Self {
            debounce: Duration::from_millis(settings.debounce_ms),
            filter: ChangeFilter {
                meaningful_only: settings.meaningful_only,
                summary_is_meaningful: settings.summary_is_meaningful,
            },
        }
    }
}

/// Watches one status file. Events are pulled from the receiver returned by
/// [`StatusWatcher::start`].
pub struct StatusWatcher {
    path: PathBuf,
    options: WatchOptions,
    running: Option<Running>,
}

struct Running {
    watcher: RecommendedWatcher,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl StatusWatcher {
    pub fn new(path: impl Into<PathBuf>, options: WatchOptions) -> Self {
        Self {
            path: path.into(),
            options,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Begin watching. The parent directory must exist; the file itself may
    /// appear later.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<StatusChangedEvent>> {
        if self.running.is_some() {
            bail!("status watcher already started for {}", self.path.display());
        }
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name: OsString = self
            .path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| anyhow!("status path has no file name: {}", self.path.display()))?;

        let (notify_tx, notify_rx) = mpsc::channel::<()>(100);
        let mut watcher = notify::recommended_watcher(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) if touches(&event, &file_name) => {
                    let _ = notify_tx.try_send(());
                }
                Ok(_) => {}
                Err(err) => debug!(err = %err, "status watch error"),
            },
        )
        .context("create filesystem watcher")?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", parent.display()))?;
        info!(path = %self.path.display(), debounce_ms = self.options.debounce.as_millis() as u64, "watching status file");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(debounce_loop(
            self.path.clone(),
            self.options,
            notify_rx,
            shutdown_rx,
            events_tx,
        ));
        self.running = Some(Running {
            watcher,
            shutdown: shutdown_tx,
            task,
        });
        Ok(events_rx)
    }

    /// Stop watching. No event is delivered after this returns.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        drop(running.watcher);
        let _ = running.shutdown.send(());
        if let Err(err) = running.task.await {
            warn!(err = %err, "status watcher task failed");
        }
        debug!(path = %self.path.display(), "status watcher stopped");
    }
}

fn touches(event: &NotifyEvent, file_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

/// Reset the deadline on every notification; read and emit when it passes.
pub(crate) async fn debounce_loop(
    path: PathBuf,
    options: WatchOptions,
    mut notifications: mpsc::Receiver<()>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<StatusChangedEvent>,
) {
    let mut previous: Option<StatusSnapshot> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            received = notifications.recv() => match received {
                Some(()) => deadline = Some(Instant::now() + options.debounce),
                None => break,
            },
            () = sleep_until(deadline) => {
                deadline = None;
                let Some(event) = observe(&path, &options.filter, &mut previous) else {
                    continue;
                };
                if events.send(event).is_err() {
                    debug!("status event receiver dropped");
                    break;
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Read the snapshot and build an event when the filter accepts the change.
/// The baseline moves forward even for filtered rewrites.
fn observe(
    path: &Path,
    filter: &ChangeFilter,
    previous: &mut Option<StatusSnapshot>,
) -> Option<StatusChangedEvent> {
    let current = try_read_status(path)?;
    let delta = StatusDelta::between(previous.as_ref(), &current);
    let first = previous.is_none();
    let accepted = filter.accepts(first, &delta);
    let prior = previous.replace(current.clone());
    if !accepted {
        debug!(path = %path.display(), "status rewrite without meaningful change");
        return None;
    }
    Some(StatusChangedEvent {
        previous: prior,
        current,
        delta,
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::Progress;
    use std::fs;

    fn write_snapshot(path: &Path, completed: u32, total: u32) {
        let snapshot = StatusSnapshot {
            progress: Progress { completed, total },
            ..StatusSnapshot::default()
        };
        fs::write(path, serde_json::to_string(&snapshot).expect("serialize")).expect("write");
    }

    fn options() -> WatchOptions {
        WatchOptions {
            debounce: Duration::from_millis(2_000),
            filter: ChangeFilter::default(),
        }
    }

    struct Harness {
        notify: mpsc::Sender<()>,
        shutdown: Option<oneshot::Sender<()>>,
        events: mpsc::UnboundedReceiver<StatusChangedEvent>,
        task: JoinHandle<()>,
    }

    fn spawn_loop(path: &Path, options: WatchOptions) -> Harness {
        let (notify, notify_rx) = mpsc::channel(100);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(debounce_loop(
            path.to_path_buf(),
            options,
            notify_rx,
            shutdown_rx,
            events_tx,
        ));
        Harness {
            notify,
            shutdown: Some(shutdown),
            events,
            task,
        }
    }

    /// Three rewrites inside one debounce window yield one event with the
    /// last content.
    #[tokio::test(start_paused = true)]
    async fn burst_within_window_emits_once_with_last_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".status.json");
        let mut harness = spawn_loop(&path, options());

        for completed in 1..=3 {
            write_snapshot(&path, completed, 4);
            harness.notify.send(()).await.expect("notify");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let event = harness.events.recv().await.expect("event");
        assert_eq!(event.previous, None);
        assert_eq!(event.current.progress, Progress { completed: 3, total: 4 });
        assert_eq!(event.delta.completed_delta, 3);
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_snapshot_keeps_previous_baseline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".status.json");
        let mut harness = spawn_loop(&path, options());

        write_snapshot(&path, 1, 4);
        harness.notify.send(()).await.expect("notify");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let first = harness.events.recv().await.expect("first event");
        assert_eq!(first.current.progress.completed, 1);

        fs::write(&path, "{ half written").expect("write garbage");
        harness.notify.send(()).await.expect("notify");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(harness.events.try_recv().is_err());

        write_snapshot(&path, 2, 4);
        harness.notify.send(()).await.expect("notify");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let second = harness.events.recv().await.expect("second event");
        assert_eq!(second.previous.map(|p| p.progress.completed), Some(1));
        assert_eq!(second.delta.completed_delta, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bookkeeping_only_rewrite_is_filtered() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".status.json");
        let mut harness = spawn_loop(&path, options());

        write_snapshot(&path, 2, 4);
        harness.notify.send(()).await.expect("notify");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        harness.events.recv().await.expect("first event");

        let mut touched = StatusSnapshot {
            progress: Progress {
                completed: 2,
                total: 4,
            },
            ..StatusSnapshot::default()
        };
        touched.last_updated = Some("2026-05-01T10:00:00Z".to_string());
        fs::write(&path, serde_json::to_string(&touched).expect("serialize")).expect("write");
        harness.notify.send(()).await.expect("notify");
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_pending_deadline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".status.json");
        let mut harness = spawn_loop(&path, options());

        write_snapshot(&path, 1, 2);
        harness.notify.send(()).await.expect("notify");
        if let Some(shutdown) = harness.shutdown.take() {
            shutdown.send(()).expect("shutdown");
        }
        harness.task.await.expect("join");
        assert!(harness.events.recv().await.is_none());
    }
}
