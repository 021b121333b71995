use futures_util::{future::OptionFuture, FutureExt};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    future::Future,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

const WATCH_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Debouncing,
    Flushing,
}

/// Single-timer debounce with a pending flag for events that land mid-flush.
#[derive(Debug)]
pub struct DebounceMachine {
    window: Duration,
    deadline: Option<Instant>,
    flushing: bool,
    pending: bool,
}

impl DebounceMachine {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            flushing: false,
            pending: false,
        }
    }

    pub fn phase(&self) -> DispatchPhase {
        if self.flushing {
            DispatchPhase::Flushing
        } else if self.deadline.is_some() {
            DispatchPhase::Debouncing
        } else {
            DispatchPhase::Idle
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Re-arms the timer.
    pub fn on_event(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// Timer expiry. Returns `true` when a flush should start now.
    pub fn on_deadline(&mut self) -> bool {
        self.deadline = None;
        if self.flushing {
            self.pending = true;
            return false;
        }
        self.flushing = true;
        true
    }

    /// Returns `true` when the pending flag asks for one more pass.
    pub fn on_flush_complete(&mut self) -> bool {
        if self.pending {
            self.pending = false;
            return true;
        }
        self.flushing = false;
        false
    }
}

/// State owned by one dispatcher and refreshed on every flush.
pub trait FlushTarget: Send + 'static {
    fn name(&self) -> &'static str;

    fn flush(&mut self) -> impl Future<Output = ()> + Send + '_;
}

/// Drains change signals through the debounce machine until shutdown.
///
/// The target moves into the flush task and comes back when it finishes, so
/// two flushes can never overlap.
pub async fn run_dispatcher<T: FlushTarget>(
    target: T,
    window: Duration,
    mut events: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = target.name();
    let mut machine = DebounceMachine::new(window);
    let mut idle_target = Some(target);
    let mut in_flight: Option<JoinHandle<T>> = None;
    let mut events_open = true;

    loop {
        let deadline = machine.deadline();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv(), if events_open => {
                match event {
                    Some(()) => machine.on_event(Instant::now()),
                    None => {
                        debug!(event = "dispatcher_events_closed", dispatcher = name);
                        events_open = false;
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if machine.on_deadline() {
                    in_flight = start_flush(&mut idle_target);
                } else {
                    debug!(
                        event = "flush_pending",
                        dispatcher = name,
                        phase = ?machine.phase(),
                        pending = machine.is_pending()
                    );
                }
            }
            Some(joined) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                match joined {
                    Ok(target) => idle_target = Some(target),
                    Err(err) => {
                        // Panics are caught inside the task, so only cancellation lands here.
                        error!(event = "flush_cancelled", dispatcher = name, error = %err);
                        break;
                    }
                }
                if machine.on_flush_complete() {
                    in_flight = start_flush(&mut idle_target);
                }
            }
        }
    }
    info!(event = "dispatcher_stopped", dispatcher = name);
}

fn start_flush<T: FlushTarget>(slot: &mut Option<T>) -> Option<JoinHandle<T>> {
    let mut target = slot.take()?;
    Some(tokio::spawn(async move {
        if AssertUnwindSafe(target.flush()).catch_unwind().await.is_err() {
            error!(event = "flush_panicked", dispatcher = target.name());
        }
        target
    }))
}

/// A directory to watch and the file names in it that count as changes.
#[derive(Clone, Debug)]
pub struct WatchTarget {
    pub dir: PathBuf,
    pub file_name: String,
    /// Also accept siblings such as `-wal` and `-shm` journals.
    pub match_prefix: bool,
}

impl WatchTarget {
    pub fn for_file(path: &Path, match_prefix: bool) -> Self {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            dir,
            file_name,
            match_prefix,
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        let name = name.to_string_lossy();
        if self.match_prefix {
            name.starts_with(&self.file_name)
        } else {
            name == self.file_name.as_str()
        }
    }
}

/// Keeps a notify watcher attached to `target.dir`, re-attaching while the
/// directory is missing. Every qualifying event becomes one `()` signal.
pub fn spawn_watcher(
    target: WatchTarget,
    events: mpsc::UnboundedSender<()>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(watch_loop(target, events, shutdown, WATCH_RETRY))
}

async fn watch_loop(
    target: WatchTarget,
    events: mpsc::UnboundedSender<()>,
    mut shutdown: watch::Receiver<bool>,
    retry: Duration,
) {
    let mut warned = false;
    loop {
        match attach(&target, events.clone()) {
            Ok(watcher) => {
                info!(event = "watch_attached", dir = %target.dir.display(), file = %target.file_name);
                warned = false;
                let _ = events.send(());
                if hold_until_gone(&target, watcher, &mut shutdown, retry).await {
                    return;
                }
                warn!(event = "watch_lost", dir = %target.dir.display());
                warned = true;
            }
            Err(err) => {
                if !warned {
                    warn!(event = "watch_unavailable", dir = %target.dir.display(), error = %err);
                    warned = true;
                }
            }
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(retry) => {}
        }
    }
}

fn attach(
    target: &WatchTarget,
    events: mpsc::UnboundedSender<()>,
) -> notify::Result<RecommendedWatcher> {
    let matcher = target.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.paths.iter().any(|path| matcher.matches(path)) {
                let _ = events.send(());
            }
        }
    })?;
    watcher.watch(&target.dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Returns `true` on shutdown, `false` once the directory disappeared.
async fn hold_until_gone(
    target: &WatchTarget,
    _watcher: RecommendedWatcher,
    shutdown: &mut watch::Receiver<bool>,
    retry: Duration,
) -> bool {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return true,
            _ = sleep(retry) => {
                if !target.dir.exists() {
                    return false;
                }
            }
        }
    }
}
