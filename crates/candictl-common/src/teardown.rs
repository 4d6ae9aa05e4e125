//! Teardown registry: ordered shutdown hooks and the process cancellation token
//!
//! Hooks run in reverse registration order, each exactly once. Shutdown is
//! triggered either explicitly (end of a command) or by the first SIGINT or
//! SIGTERM. A second signal exits the process with code 1.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;

type HookFn = Box<dyn FnOnce() + Send + 'static>;

struct Hook {
    id: HookId,
    name: String,
    run: HookFn,
}

/// Identifies a registered hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// What a received signal did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Deferred,
    Shutdown,
    Repeated,
}

/// Process-wide list of shutdown hooks
pub struct Teardown {
    hooks: Mutex<Vec<Hook>>,
    next_id: AtomicU64,
    token: CancellationToken,
    shutting_down: AtomicBool,
    interrupted: AtomicBool,
    deferred_scopes: AtomicUsize,
    pending_interrupt: AtomicBool,
}

impl Default for Teardown {
    fn default() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            token: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            deferred_scopes: AtomicUsize::new(0),
            pending_interrupt: AtomicBool::new(false),
        }
    }
}

impl Teardown {
    /// Create a shared registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a named hook.
    ///
    /// If shutdown already started the hook runs immediately.
    pub fn register(&self, name: impl Into<String>, hook: impl FnOnce() + Send + 'static) -> HookId {
        let name = name.into();
        let id = HookId(self.next_id.fetch_add(1, Ordering::SeqCst));
        {
            let mut hooks = self.hooks.lock();
            if !self.shutting_down.load(Ordering::SeqCst) {
                debug!(hook = %name, "Teardown hook registered");
                hooks.push(Hook {
                    id,
                    name,
                    run: Box::new(hook),
                });
                return id;
            }
        }
        debug!(hook = %name, "Shutdown in progress, running hook immediately");
        hook();
        id
    }

    /// Register a hook that is dropped, without running, together with the
    /// returned guard.
    pub fn register_scoped(
        self: &Arc<Self>,
        name: impl Into<String>,
        hook: impl FnOnce() + Send + 'static,
    ) -> HookGuard {
        HookGuard {
            id: self.register(name, hook),
            teardown: self.clone(),
        }
    }

    /// Remove a hook without running it. Returns false if it already ran.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.lock();
        match hooks.iter().position(|h| h.id == id) {
            Some(pos) => {
                let hook = hooks.remove(pos);
                debug!(hook = %hook.name, "Teardown hook removed");
                true
            }
            None => false,
        }
    }

    /// Cancel the token and run every hook in reverse order. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks.into_iter().rev() {
            debug!(hook = %hook.name, "Running teardown hook");
            (hook.run)();
        }
    }

    /// Token that becomes cancelled when shutdown begins
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once shutdown has started
    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of hooks waiting to run
    pub fn pending_hooks(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Defer signal handling until the returned guard is dropped
    pub fn non_interruptible(&self) -> NonInterruptible<'_> {
        self.deferred_scopes.fetch_add(1, Ordering::SeqCst);
        NonInterruptible { teardown: self }
    }

    /// Record an interrupt. A deferred one still counts toward the next
    /// signal being a repeat.
    fn interrupt(&self) -> Interrupt {
        let repeated = self.interrupted.swap(true, Ordering::SeqCst);
        if self.deferred_scopes.load(Ordering::SeqCst) > 0 {
            self.pending_interrupt.store(true, Ordering::SeqCst);
            return Interrupt::Deferred;
        }
        if repeated {
            return Interrupt::Repeated;
        }
        self.shutdown();
        Interrupt::Shutdown
    }

    /// Block until SIGINT or SIGTERM, then shut down.
    ///
    /// Keeps listening afterwards: a second signal exits the process with code 1.
    pub async fn wait_for_interrupt(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        loop {
            let kind = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };

            match self.interrupt() {
                Interrupt::Deferred => {
                    warn!(signal = kind, "Interrupt deferred until the interactive session ends")
                }
                Interrupt::Shutdown => info!(signal = kind, "Interrupted, running teardown"),
                Interrupt::Repeated => {
                    error!("Killed by interrupting process twice");
                    std::process::exit(1);
                }
            }
        }
    }
}

/// Keeps a hook registered while alive
pub struct HookGuard {
    id: HookId,
    teardown: Arc<Teardown>,
}

impl fmt::Debug for HookGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookGuard").field("id", &self.id).finish()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        self.teardown.unregister(self.id);
    }
}

/// Scope during which interrupts are deferred
pub struct NonInterruptible<'a> {
    teardown: &'a Teardown,
}

impl Drop for NonInterruptible<'_> {
    fn drop(&mut self) {
        let previous = self.teardown.deferred_scopes.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.teardown.pending_interrupt.swap(false, Ordering::SeqCst) {
            info!("Running deferred interrupt");
            self.teardown.shutdown();
        }
    }
}
