//! Cross-process named events and mutexes.
//!
//! On Windows these are native `Global\` kernel objects. Elsewhere they are
//! emulated: each name maps to a small shared-memory record guarded by an
//! advisory file lock, see [`emulated`]. The public surface is identical.
//!
//! A [`SystemEvents`] value is one "context": it owns the background
//! threads of the emulation and the per-context set of held lock names used
//! to refuse recursive locking.

#[cfg(unix)]
pub mod emulated;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
use emulated as imp;
#[cfg(windows)]
use self::windows as imp;

pub use imp::{LocalEvent, NamedEvent, NamedMutex};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{HidportError, Result};

/// A record untouched for this long is considered abandoned.
pub const RECORD_TIMEOUT_MS: u32 = 30_000;
/// A `ttl` further than this in the future means the clock jumped back.
pub const FUTURE_TOLERANCE_MS: u32 = 1_000;
/// Period of the background ttl refresh.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// A refresh is skipped if the previous one was this recent.
pub const REFRESH_MIN_GAP: Duration = Duration::from_secs(4);
/// Sleep between `try_lock` attempts.
pub const LOCK_SPIN: Duration = Duration::from_millis(50);
/// Upper bound on how long a waiter sleeps without re-checking.
pub const WAIT_TICK: Duration = Duration::from_millis(50);

pub const DEFAULT_SHM_PREFIX: &str = "/hp";

/// What a name refers to; part of the hashed resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Event,
    Mutex,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Event => "event",
            Kind::Mutex => "mutex",
        }
    }
}

/// `base64url(SHA-256("kind:name"))`, without padding.
pub fn resource_key(kind: Kind, name: &str) -> String {
    let input = format!("{}:{name}", kind.as_str());
    let digest = ring::digest::digest(&ring::digest::SHA256, input.as_bytes());
    URL_SAFE_NO_PAD.encode(digest.as_ref())
}

/// Default directory for the emulation's backing files.
pub fn default_dir() -> PathBuf {
    std::env::temp_dir().join("hidport-sync")
}

/// Something [`SystemEvents::wait_any`] can wait on.
#[derive(Clone, Copy)]
pub enum Waitable<'a> {
    Local(&'a LocalEvent),
    Named(&'a NamedEvent),
}

/// Names of mutexes currently locked through this context.
#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    names: Mutex<HashSet<String>>,
}

impl LockRegistry {
    /// Reserve `name`; fails if this context already holds it.
    pub(crate) fn reserve(&self, name: &str) -> Result<()> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if !names.insert(name.to_string()) {
            return Err(HidportError::InvalidOperation(format!(
                "mutex '{name}' is already locked in this context"
            )));
        }
        Ok(())
    }

    pub(crate) fn release(&self, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

/// One named-primitive context. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SystemEvents {
    ns: Arc<imp::Namespace>,
}

impl SystemEvents {
    /// Context over the default namespace.
    pub fn new() -> Result<Self> {
        Self::with_namespace(default_dir(), DEFAULT_SHM_PREFIX)
    }

    /// Context over an explicit namespace. Contexts that share `dir` and
    /// `prefix` see the same objects, whether in one process or many.
    ///
    /// `prefix` starts POSIX shared-memory names (keep it short, macOS
    /// limits names to 31 bytes) and kernel object names on Windows.
    pub fn with_namespace(dir: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        Ok(SystemEvents {
            ns: imp::Namespace::start(dir.into(), prefix)?,
        })
    }

    pub fn create_event(&self, name: &str) -> Result<NamedEvent> {
        NamedEvent::create(&self.ns, name)
    }

    pub fn create_mutex(&self, name: &str) -> Result<NamedMutex> {
        NamedMutex::create(&self.ns, name)
    }

    /// Whether a live mutex called `name` exists anywhere, without creating
    /// it. Any failure counts as "no".
    pub fn mutex_may_exist(&self, name: &str) -> bool {
        self.ns.mutex_may_exist(name)
    }

    /// A process-local event usable in [`wait_any`](Self::wait_any).
    pub fn local_event(&self) -> Result<LocalEvent> {
        LocalEvent::new(&self.ns)
    }

    /// Wait until one of `items` is signalled. Returns its index, or `None`
    /// on timeout (`None` timeout waits forever).
    pub fn wait_any(
        &self,
        items: &[Waitable<'_>],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        self.ns.wait_any(items, timeout)
    }

    /// Whether a mutex called `name` is currently locked through this context.
    pub(crate) fn is_locally_locked(&self, name: &str) -> bool {
        self.ns.locks.contains(name)
    }

    /// Stop the background threads. Existing handles keep working but are
    /// no longer refreshed.
    pub fn shutdown(&self) {
        self.ns.shutdown();
    }
}
