//! Intermediate state streaming
//!
//! While apply or destroy runs, the tool rewrites its state file many times.
//! [`StateSaver`] watches that file and hands each new non-empty content to a
//! [`StateDestination`], so a crash halfway through a long apply still leaves
//! the cluster with a recent copy of the state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use candictl_common::Result;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Where intermediate states go
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateDestination: Send + Sync {
    /// Persist one snapshot of the state file
    async fn save_state(&self, state: &[u8]) -> Result<()>;
}

/// Watches a state file and forwards changes to a destination
pub struct StateSaver {
    destination: Arc<dyn StateDestination>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    started: bool,
}

impl std::fmt::Debug for StateSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSaver")
            .field("started", &self.started)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl StateSaver {
    /// Saver that writes to `destination`
    pub fn new(destination: Arc<dyn StateDestination>) -> Self {
        Self {
            destination,
            token: CancellationToken::new(),
            task: None,
            started: false,
        }
    }

    /// Whether the watcher task is running
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Start watching `path`. A saver runs at most once; later calls are no-ops.
    pub fn start(&mut self, path: &Path) {
        if self.started {
            return;
        }
        self.started = true;

        let path = path.to_path_buf();
        let last = std::fs::read(&path).unwrap_or_default();
        let (tx, rx) = mpsc::channel(1);
        let watcher = watch_file(&path, tx);

        let destination = self.destination.clone();
        let token = self.token.clone();
        self.task = Some(tokio::spawn(async move {
            // dropped with the task
            let _watcher = watcher;
            run(path, last, rx, destination, token).await;
        }));
    }

    /// Stop watching. The file is checked one last time and any in-flight
    /// save finishes before this returns.
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "State saver task failed");
            }
        }
    }
}

fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let file_name = path.file_name()?.to_os_string();
    let dir = path.parent()?.to_path_buf();

    let watcher = recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        if event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
        {
            // a pending notification already covers this change
            let _ = tx.try_send(());
        }
    });

    match watcher {
        Ok(mut w) => match w.watch(&dir, RecursiveMode::NonRecursive) {
            Ok(()) => Some(w),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot watch state directory, polling only");
                None
            }
        },
        Err(e) => {
            warn!(error = %e, "Cannot create file watcher, polling only");
            None
        }
    }
}

async fn run(
    path: PathBuf,
    mut last: Vec<u8>,
    mut rx: mpsc::Receiver<()>,
    destination: Arc<dyn StateDestination>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = rx.recv() => {}
            _ = ticker.tick() => {}
        }
        check(&path, &mut last, destination.as_ref()).await;
    }
    check(&path, &mut last, destination.as_ref()).await;
    debug!(path = %path.display(), "State saver stopped");
}

async fn check(path: &Path, last: &mut Vec<u8>, destination: &dyn StateDestination) {
    let Ok(data) = tokio::fs::read(path).await else {
        return;
    };
    if data.is_empty() || data == *last {
        return;
    }
    match destination.save_state(&data).await {
        Ok(()) => {
            debug!(path = %path.display(), bytes = data.len(), "Intermediate state saved");
            *last = data;
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to save intermediate state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candictl_common::Error;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl StateDestination for Recorder {
        async fn save_state(&self, state: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(state.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_saves_changed_content_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.tfstate");

        let mut destination = MockStateDestination::new();
        destination
            .expect_save_state()
            .withf(|state| state == br#"{"serial":1}"#)
            .times(1)
            .returning(|_| Ok(()));

        let mut saver = StateSaver::new(Arc::new(destination));
        saver.start(&path);
        std::fs::write(&path, br#"{"serial":1}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        saver.stop().await;
        assert!(!saver.is_running());
    }

    #[tokio::test]
    async fn test_ignores_initial_and_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.tfstate");
        std::fs::write(&path, b"initial").unwrap();

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut saver = StateSaver::new(recorder.clone());
        saver.start(&path);
        std::fs::write(&path, b"").unwrap();
        saver.stop().await;

        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_final_check_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.tfstate");

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut saver = StateSaver::new(recorder.clone());
        saver.start(&path);
        std::fs::write(&path, b"last").unwrap();
        saver.stop().await;

        assert_eq!(recorder.0.lock().unwrap().last().unwrap(), b"last");
    }

    #[tokio::test]
    async fn test_destination_errors_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.tfstate");

        let mut destination = MockStateDestination::new();
        destination
            .expect_save_state()
            .returning(|_| Err(Error::kube_api("patch secret", "connection refused")));

        let mut saver = StateSaver::new(Arc::new(destination));
        saver.start(&path);
        std::fs::write(&path, b"state").unwrap();
        saver.stop().await;
    }

    #[tokio::test]
    async fn test_start_after_stop_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.tfstate");

        let mut saver = StateSaver::new(Arc::new(MockStateDestination::new()));
        saver.start(&path);
        saver.stop().await;
        saver.start(&path);
        assert!(!saver.is_running());
    }
}
