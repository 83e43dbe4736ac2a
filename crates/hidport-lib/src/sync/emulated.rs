//! Named events and mutexes for systems without named kernel objects.
//!
//! Every name owns a backing file `<dir>/<key>` and a POSIX shared-memory
//! segment `<prefix><key[..24]>` holding a fixed-size little-endian record.
//! All access happens inside a transaction that holds an exclusive `flock`
//! on the backing file, so the file serializes concurrent updates and the
//! segment carries the state.
//!
//! Waiters are woken by touching the backing file's mtime after each change.
//! On Linux an inotify thread watches the directory; everywhere waits are
//! re-checked at least every [`WAIT_TICK`].
//!
//! Records carry a `ttl` stamp from the system-wide monotonic clock. Live
//! handles re-stamp it from a background refresh job, so a record whose
//! owners all crashed goes stale and is reset by the next transaction.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::time::{ClockId, clock_gettime};

use super::{
    FUTURE_TOLERANCE_MS, Kind, LOCK_SPIN, LockRegistry, RECORD_TIMEOUT_MS, REFRESH_INTERVAL,
    REFRESH_MIN_GAP, WAIT_TICK, Waitable, resource_key,
};
use crate::error::{HidportError, Result};

/// Retry interval while another process holds the backing file lock.
const FLOCK_RETRY: Duration = Duration::from_millis(10);

/// Milliseconds of the system monotonic clock, truncated to 32 bits.
pub fn now_ms() -> u32 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64)
            .wrapping_mul(1000)
            .wrapping_add(ts.tv_nsec() as u64 / 1_000_000) as u32,
        Err(_) => 0,
    }
}

/// Signed distance from `stamp` to `now`, wrap-aware.
fn age(now: u32, stamp: u32) -> i64 {
    now.wrapping_sub(stamp) as i32 as i64
}

fn is_stale(now: u32, stamp: u32) -> bool {
    let a = age(now, stamp);
    a > RECORD_TIMEOUT_MS as i64 || a < -(FUTURE_TOLERANCE_MS as i64)
}

// ── Records ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub ttl: u32,
    pub ref_count: i32,
}

pub trait Record: Copy + Default + PartialEq {
    const SIZE: usize;
    fn decode(b: &[u8]) -> Self;
    fn encode(&self, b: &mut [u8]);
    fn header(&mut self) -> &mut Header;
    /// Type-specific cleanup after the header checks passed.
    fn expire(&mut self, _now: u32) {}
}

fn u32_at(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

fn put_u32(b: &mut [u8], at: usize, v: u32) {
    b[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRecord {
    pub header: Header,
    pub set_id: i32,
    pub reset_id: i32,
}

impl Record for EventRecord {
    const SIZE: usize = 16;

    fn decode(b: &[u8]) -> Self {
        EventRecord {
            header: Header {
                ttl: u32_at(b, 0),
                ref_count: u32_at(b, 4) as i32,
            },
            set_id: u32_at(b, 8) as i32,
            reset_id: u32_at(b, 12) as i32,
        }
    }

    fn encode(&self, b: &mut [u8]) {
        put_u32(b, 0, self.header.ttl);
        put_u32(b, 4, self.header.ref_count as u32);
        put_u32(b, 8, self.set_id as u32);
        put_u32(b, 12, self.reset_id as u32);
    }

    fn header(&mut self) -> &mut Header {
        &mut self.header
    }
}

impl EventRecord {
    pub fn is_set(&self) -> bool {
        self.set_id != self.reset_id
    }
}

pub const NO_LOCK: [u8; 16] = [0; 16];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutexRecord {
    pub header: Header,
    pub lock_ttl: u32,
    pub reserved: u32,
    pub lock_guid: [u8; 16],
}

impl Record for MutexRecord {
    const SIZE: usize = 32;

    fn decode(b: &[u8]) -> Self {
        let mut lock_guid = NO_LOCK;
        lock_guid.copy_from_slice(&b[16..32]);
        MutexRecord {
            header: Header {
                ttl: u32_at(b, 0),
                ref_count: u32_at(b, 4) as i32,
            },
            lock_ttl: u32_at(b, 8),
            reserved: u32_at(b, 12),
            lock_guid,
        }
    }

    fn encode(&self, b: &mut [u8]) {
        put_u32(b, 0, self.header.ttl);
        put_u32(b, 4, self.header.ref_count as u32);
        put_u32(b, 8, self.lock_ttl);
        put_u32(b, 12, self.reserved);
        b[16..32].copy_from_slice(&self.lock_guid);
    }

    fn header(&mut self) -> &mut Header {
        &mut self.header
    }

    fn expire(&mut self, now: u32) {
        if self.lock_guid != NO_LOCK && is_stale(now, self.lock_ttl) {
            log::debug!("named mutex: lock expired, clearing");
            self.lock_guid = NO_LOCK;
            self.lock_ttl = 0;
        }
    }
}

/// Reset an abandoned record. Returns `true` if it was reset.
pub fn sanitize<R: Record>(rec: &mut R, now: u32) -> bool {
    let h = *rec.header();
    if h.ref_count <= 0 || is_stale(now, h.ttl) {
        if *rec != R::default() {
            log::debug!(
                "named primitive: resetting abandoned record (ref_count {}, ttl age {} ms)",
                h.ref_count,
                age(now, h.ttl)
            );
        }
        *rec = R::default();
        return true;
    }
    rec.expire(now);
    false
}

// ── Shared memory mapping ──

struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    fn new(shm: &File, len: usize) -> Result<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| HidportError::InvalidOperation("empty record".into()))?;
        // SAFETY: fresh shared mapping of an fd we own; unmapped on drop.
        let ptr = unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                shm,
                0,
            )
        }?;
        Ok(Mapping { ptr, len })
    }

    fn bytes(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is `len` bytes long and lives as long as self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from mmap and are not used afterwards.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::debug!("munmap failed: {e}");
        }
    }
}

// ── Wake-ups ──

/// Generation counter bumped on every observed change.
#[derive(Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Notifier {
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    pub fn notify(&self) {
        *self.lock() += 1;
        self.cond.notify_all();
    }

    /// Wait until the generation moves past `seen` or `timeout` elapses.
    pub fn wait_past(&self, seen: u64, timeout: Duration) {
        let guard = self.lock();
        let _ = self
            .cond
            .wait_timeout_while(guard, timeout, |g| *g == seen)
            .unwrap_or_else(|e| e.into_inner());
    }
}

#[derive(Default)]
struct Stop {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl Stop {
    fn set(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep up to `d`; returns `true` if stopped.
    fn sleep(&self, d: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        *self
            .cond
            .wait_timeout_while(guard, d, |s| !*s)
            .unwrap_or_else(|e| e.into_inner())
            .0
    }
}

// ── Namespace ──

struct Live {
    kind: Kind,
    key: String,
    /// Our lock GUID while the mutex is held.
    held: Option<Arc<Mutex<Option<[u8; 16]>>>>,
}

/// One context's view of a directory of named primitives.
pub struct Namespace {
    dir: PathBuf,
    shm_prefix: String,
    notifier: Arc<Notifier>,
    pub(crate) locks: LockRegistry,
    live: Mutex<HashMap<u64, Live>>,
    next_id: AtomicU64,
    last_refresh: Mutex<Option<Instant>>,
    stop: Arc<Stop>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Namespace {
    pub fn start(dir: PathBuf, prefix: &str) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&dir)?;
        let ns = Arc::new(Namespace {
            dir,
            shm_prefix: prefix.to_string(),
            notifier: Arc::new(Notifier::default()),
            locks: LockRegistry::default(),
            live: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            last_refresh: Mutex::new(None),
            stop: Arc::new(Stop::default()),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::new();
        let weak = Arc::downgrade(&ns);
        let stop = Arc::clone(&ns.stop);
        threads.push(
            std::thread::Builder::new()
                .name("hidport-sync-refresh".into())
                .spawn(move || refresh_loop(weak, stop))?,
        );
        #[cfg(target_os = "linux")]
        match inotify::spawn(&ns.dir, Arc::clone(&ns.notifier), Arc::clone(&ns.stop)) {
            Ok(handle) => threads.push(handle),
            Err(e) => log::debug!("inotify unavailable, relying on tick: {e}"),
        }
        *ns.threads.lock().unwrap_or_else(|e| e.into_inner()) = threads;
        log::debug!("named primitives at {}", ns.dir.display());
        Ok(ns)
    }

    pub fn shutdown(&self) {
        self.stop.set();
        let threads: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let current = std::thread::current().id();
        for t in threads {
            if t.thread().id() != current && t.join().is_err() {
                log::warn!("named primitive thread panicked");
            }
        }
    }

    fn shm_name(&self, key: &str) -> String {
        format!("{}{}", self.shm_prefix, &key[..24])
    }

    /// Run `f` on the record for `key` under the backing file lock. With
    /// `create == false`, returns `Ok(None)` when the record does not exist.
    pub fn transact<R: Record, T>(
        &self,
        key: &str,
        create: bool,
        f: impl FnOnce(&mut R) -> T,
    ) -> Result<Option<T>> {
        let path = self.dir.join(key);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if !create && e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let locked = lock_file(file)?;

        let shm_name = self.shm_name(key);
        let mut flags = OFlag::O_RDWR;
        if create {
            flags |= OFlag::O_CREAT;
        }
        let shm = match shm_open(shm_name.as_str(), flags, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(fd) => File::from(fd),
            Err(Errno::ENOENT) if !create => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if shm.metadata()?.len() < R::SIZE as u64 {
            shm.set_len(R::SIZE as u64)?;
        }

        let mut map = Mapping::new(&shm, R::SIZE)?;
        let bytes = map.bytes();
        let before = R::decode(bytes);
        let mut rec = before;
        sanitize(&mut rec, now_ms());
        let out = f(&mut rec);
        let wipe = rec.header().ref_count <= 0;
        if wipe {
            rec = R::default();
        }
        if rec != before {
            rec.encode(bytes);
            drop(map);
            if wipe {
                let _ = shm_unlink(shm_name.as_str());
            }
            if let Err(e) = locked.set_modified(SystemTime::now()) {
                log::trace!("touch {} failed: {e}", path.display());
            }
            self.notifier.notify();
        }
        Ok(Some(out))
    }

    fn register(&self, live: Live) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, live);
        id
    }

    fn unregister(&self, id: u64) {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Count one more live handle on `key`.
    fn attach<R: Record>(&self, key: &str) -> Result<()> {
        self.transact::<R, _>(key, true, |rec| {
            let h = rec.header();
            h.ttl = now_ms();
            h.ref_count += 1;
        })?;
        Ok(())
    }

    fn detach<R: Record>(&self, key: &str) {
        let result = self.transact::<R, _>(key, false, |rec| {
            rec.header().ref_count -= 1;
        });
        if let Err(e) = result {
            log::debug!("named primitive: detach failed: {e}");
        }
    }

    /// Re-stamp every live record, unless that happened very recently.
    pub fn refresh(&self) {
        {
            let mut last = self.last_refresh.lock().unwrap_or_else(|e| e.into_inner());
            if last.is_some_and(|t| t.elapsed() < REFRESH_MIN_GAP) {
                return;
            }
            *last = Some(Instant::now());
        }
        let snapshot: Vec<(Kind, String, Option<[u8; 16]>)> = {
            let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.values()
                .map(|l| {
                    let guid = l
                        .held
                        .as_ref()
                        .and_then(|h| *h.lock().unwrap_or_else(|e| e.into_inner()));
                    (l.kind, l.key.clone(), guid)
                })
                .collect()
        };
        for (kind, key, guid) in snapshot {
            let now = now_ms();
            let result = match kind {
                Kind::Event => self
                    .transact::<EventRecord, _>(&key, false, |rec| {
                        restamp(&mut rec.header, now);
                    })
                    .map(|_| ()),
                Kind::Mutex => self
                    .transact::<MutexRecord, _>(&key, false, |rec| {
                        restamp(&mut rec.header, now);
                        if let Some(g) = guid
                            && rec.lock_guid == g
                        {
                            rec.lock_ttl = now;
                        }
                    })
                    .map(|_| ()),
            };
            if let Err(e) = result {
                log::debug!("named primitive: refresh failed: {e}");
            }
        }
    }

    pub fn mutex_may_exist(&self, name: &str) -> bool {
        let key = resource_key(Kind::Mutex, name);
        match self.transact::<MutexRecord, _>(&key, false, |rec| rec.header.ref_count > 0) {
            Ok(Some(alive)) => alive,
            Ok(None) => false,
            Err(e) => {
                log::debug!("mutex_may_exist({name}): {e}");
                false
            }
        }
    }

    pub fn wait_any(
        &self,
        items: &[Waitable<'_>],
        timeout: Option<Duration>,
    ) -> Result<Option<usize>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.notifier.generation();
            for (i, item) in items.iter().enumerate() {
                let signalled = match item {
                    Waitable::Local(e) => e.is_set(),
                    Waitable::Named(e) => e.is_set()?,
                };
                if signalled {
                    return Ok(Some(i));
                }
            }
            let slice = match deadline {
                None => WAIT_TICK,
                Some(at) => {
                    let left = at.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(WAIT_TICK)
                }
            };
            self.notifier.wait_past(seen, slice);
        }
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        self.stop.set();
    }
}

/// A handle that had been reset as abandoned counts itself back in.
fn restamp(h: &mut Header, now: u32) {
    h.ttl = now;
    if h.ref_count <= 0 {
        h.ref_count = 1;
    }
}

fn lock_file(mut file: File) -> Result<Flock<File>> {
    loop {
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => return Ok(locked),
            Err((f, Errno::EWOULDBLOCK | Errno::EINTR)) => {
                file = f;
                std::thread::sleep(FLOCK_RETRY);
            }
            Err((_, e)) => return Err(e.into()),
        }
    }
}

fn refresh_loop(ns: Weak<Namespace>, stop: Arc<Stop>) {
    while !stop.sleep(REFRESH_INTERVAL) {
        let Some(ns) = ns.upgrade() else { break };
        ns.refresh();
    }
}

#[cfg(target_os = "linux")]
mod inotify {
    use std::os::fd::AsFd;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use nix::errno::Errno;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    use super::{Notifier, Stop};

    const POLL_MS: u16 = 200;

    pub fn spawn(
        dir: &Path,
        notifier: Arc<Notifier>,
        stop: Arc<Stop>,
    ) -> std::io::Result<JoinHandle<()>> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;
        inotify.add_watch(
            dir,
            AddWatchFlags::IN_ATTRIB | AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CREATE,
        )?;
        std::thread::Builder::new()
            .name("hidport-sync-inotify".into())
            .spawn(move || {
                while !stop.is_set() {
                    let mut fds = [PollFd::new(inotify.as_fd(), PollFlags::POLLIN)];
                    match poll(&mut fds, PollTimeout::from(POLL_MS)) {
                        Ok(0) | Err(Errno::EINTR) => continue,
                        Ok(_) => {}
                        Err(e) => {
                            log::debug!("inotify poll failed: {e}");
                            break;
                        }
                    }
                    match inotify.read_events() {
                        Ok(events) if !events.is_empty() => notifier.notify(),
                        Ok(_) | Err(Errno::EAGAIN) => {}
                        Err(e) => {
                            log::debug!("inotify read failed: {e}");
                            break;
                        }
                    }
                }
            })
    }
}

// ── Handles ──

/// Common part of an event or mutex handle.
struct Handle {
    ns: Arc<Namespace>,
    name: String,
    key: String,
    id: u64,
}

/// A named, manual-reset, cross-process event.
pub struct NamedEvent {
    handle: Handle,
}

impl NamedEvent {
    pub(crate) fn create(ns: &Arc<Namespace>, name: &str) -> Result<Self> {
        let key = resource_key(Kind::Event, name);
        ns.attach::<EventRecord>(&key)?;
        let id = ns.register(Live {
            kind: Kind::Event,
            key: key.clone(),
            held: None,
        });
        Ok(NamedEvent {
            handle: Handle {
                ns: Arc::clone(ns),
                name: name.to_string(),
                key,
                id,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    fn update<T>(&self, f: impl FnOnce(&mut EventRecord) -> T) -> Result<T> {
        let now = now_ms();
        let out = self.handle.ns.transact::<EventRecord, _>(&self.handle.key, true, |rec| {
            restamp(&mut rec.header, now);
            f(rec)
        })?;
        out.ok_or_else(|| HidportError::NotFound(self.handle.name.clone()))
    }

    pub fn set(&self) -> Result<()> {
        self.update(|rec| rec.set_id = rec.set_id.wrapping_add(1))
    }

    pub fn reset(&self) -> Result<()> {
        self.update(|rec| rec.reset_id = rec.set_id)
    }

    /// Reads the state without touching the record's timestamp.
    pub fn is_set(&self) -> Result<bool> {
        let h = &self.handle;
        let out = h.ns.transact::<EventRecord, _>(&h.key, false, |rec| rec.is_set())?;
        Ok(out.unwrap_or(false))
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        let h = &self.handle;
        h.ns.unregister(h.id);
        h.ns.detach::<EventRecord>(&h.key);
    }
}

/// A named, cross-process, non-recursive mutex.
pub struct NamedMutex {
    handle: Handle,
    guid: [u8; 16],
    held: Arc<Mutex<Option<[u8; 16]>>>,
}

impl NamedMutex {
    pub(crate) fn create(ns: &Arc<Namespace>, name: &str) -> Result<Self> {
        let key = resource_key(Kind::Mutex, name);
        ns.attach::<MutexRecord>(&key)?;
        let held = Arc::new(Mutex::new(None));
        let id = ns.register(Live {
            kind: Kind::Mutex,
            key: key.clone(),
            held: Some(Arc::clone(&held)),
        });
        Ok(NamedMutex {
            handle: Handle {
                ns: Arc::clone(ns),
                name: name.to_string(),
                key,
                id,
            },
            guid: *uuid::Uuid::new_v4().as_bytes(),
            held,
        })
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn is_locked_by_me(&self) -> bool {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn attempt(&self) -> Result<bool> {
        let now = now_ms();
        let guid = self.guid;
        let got = self.handle.ns.transact::<MutexRecord, _>(&self.handle.key, true, |rec| {
            restamp(&mut rec.header, now);
            if rec.lock_guid == NO_LOCK {
                rec.lock_guid = guid;
                rec.lock_ttl = now;
            }
            rec.lock_guid == guid
        })?;
        Ok(got.unwrap_or(false))
    }

    /// Try to take the lock, spinning every [`LOCK_SPIN`] until `timeout`.
    pub fn try_lock(&self, timeout: Duration) -> Result<bool> {
        if self.is_locked_by_me() {
            return Err(HidportError::InvalidOperation(format!(
                "mutex '{}' is already locked by this handle",
                self.handle.name
            )));
        }
        let ns = &self.handle.ns;
        ns.locks.reserve(&self.handle.name)?;
        let start = Instant::now();
        loop {
            match self.attempt() {
                Ok(true) => {
                    *self.held.lock().unwrap_or_else(|e| e.into_inner()) = Some(self.guid);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    ns.locks.release(&self.handle.name);
                    return Err(e);
                }
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                ns.locks.release(&self.handle.name);
                return Ok(false);
            }
            std::thread::sleep(LOCK_SPIN.min(timeout - elapsed));
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let guid = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| {
                HidportError::InvalidOperation(format!(
                    "mutex '{}' is not locked by this handle",
                    self.handle.name
                ))
            })?;
        self.handle.ns.locks.release(&self.handle.name);
        let name = &self.handle.name;
        self.handle
            .ns
            .transact::<MutexRecord, _>(&self.handle.key, false, |rec| {
                if rec.lock_guid == guid {
                    rec.lock_guid = NO_LOCK;
                    rec.lock_ttl = 0;
                } else {
                    log::debug!("mutex '{name}': lock was lost before unlock");
                }
            })?;
        Ok(())
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        if self.is_locked_by_me()
            && let Err(e) = self.unlock()
        {
            log::debug!("mutex '{}': unlock on drop failed: {e}", self.handle.name);
        }
        let h = &self.handle;
        h.ns.unregister(h.id);
        h.ns.detach::<MutexRecord>(&h.key);
    }
}

/// Process-local manual-reset event that wakes [`Namespace::wait_any`].
pub struct LocalEvent {
    flag: AtomicBool,
    notifier: Arc<Notifier>,
}

impl LocalEvent {
    pub(crate) fn new(ns: &Arc<Namespace>) -> Result<Self> {
        Ok(LocalEvent {
            flag: AtomicBool::new(false),
            notifier: Arc::clone(&ns.notifier),
        })
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notifier.notify();
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::tests::{context, namespace};

    fn ns() -> (tempfile::TempDir, Arc<Namespace>) {
        let (dir, prefix) = namespace();
        let ns = Namespace::start(dir.path().to_path_buf(), &prefix).unwrap();
        (dir, ns)
    }

    // ── Record layout ──

    #[test]
    fn event_record_layout() {
        let rec = EventRecord {
            header: Header {
                ttl: 0x0403_0201,
                ref_count: -1,
            },
            set_id: 7,
            reset_id: 5,
        };
        let mut b = [0u8; 16];
        rec.encode(&mut b);
        assert_eq!(&b[..4], &[1, 2, 3, 4]);
        assert_eq!(&b[4..8], &[0xFF; 4]);
        assert_eq!(b[8], 7);
        assert_eq!(EventRecord::decode(&b), rec);
        assert!(rec.is_set());
    }

    #[test]
    fn mutex_record_layout() {
        let rec = MutexRecord {
            header: Header {
                ttl: 10,
                ref_count: 2,
            },
            lock_ttl: 11,
            reserved: 0,
            lock_guid: [9; 16],
        };
        let mut b = [0u8; 32];
        rec.encode(&mut b);
        assert_eq!(b[8], 11);
        assert_eq!(&b[16..], &[9; 16]);
        assert_eq!(MutexRecord::decode(&b), rec);
    }

    // ── Abandonment ──

    #[test]
    fn sanitize_resets_zero_refcount() {
        let mut rec = EventRecord {
            header: Header { ttl: 100, ref_count: 0 },
            set_id: 3,
            reset_id: 1,
        };
        assert!(sanitize(&mut rec, 100));
        assert_eq!(rec, EventRecord::default());
    }

    #[test]
    fn sanitize_resets_stale_and_future_ttl() {
        let now = 1_000_000;
        let mut stale = EventRecord {
            header: Header { ttl: now - 30_001, ref_count: 1 },
            ..Default::default()
        };
        assert!(sanitize(&mut stale, now));

        let mut future = EventRecord {
            header: Header { ttl: now + 1_001, ref_count: 1 },
            ..Default::default()
        };
        assert!(sanitize(&mut future, now));

        let mut fresh = EventRecord {
            header: Header { ttl: now - 29_000, ref_count: 1 },
            set_id: 1,
            ..Default::default()
        };
        assert!(!sanitize(&mut fresh, now));
        assert!(fresh.is_set());
    }

    #[test]
    fn sanitize_handles_clock_wrap() {
        let mut rec = EventRecord {
            header: Header { ttl: u32::MAX - 10, ref_count: 1 },
            ..Default::default()
        };
        assert!(!sanitize(&mut rec, 20));
    }

    #[test]
    fn expired_lock_is_cleared() {
        let now = 500_000;
        let mut rec = MutexRecord {
            header: Header { ttl: now, ref_count: 1 },
            lock_ttl: now - 31_000,
            lock_guid: [1; 16],
            ..Default::default()
        };
        assert!(!sanitize(&mut rec, now));
        assert_eq!(rec.lock_guid, NO_LOCK);
    }

    #[test]
    fn abandoned_lock_is_taken_over() {
        let (dir, prefix) = namespace();
        let ctx = context(&dir, &prefix);
        let ns = Namespace::start(dir.path().to_path_buf(), &prefix).unwrap();
        let key = resource_key(Kind::Mutex, "crashed");
        // A holder that vanished 40 s ago without cleaning up.
        let stale = now_ms().wrapping_sub(40_000);
        ns.transact::<MutexRecord, _>(&key, true, |rec| {
            *rec = MutexRecord {
                header: Header { ttl: stale, ref_count: 1 },
                lock_ttl: stale,
                reserved: 0,
                lock_guid: [7; 16],
            };
        })
        .unwrap();
        // Writing a stale record is itself a reset on the next read.
        let m = ctx.create_mutex("crashed").unwrap();
        assert!(m.try_lock(Duration::ZERO).unwrap());
    }

    // ── Transactions ──

    #[test]
    fn missing_record_is_none_without_create() {
        let (_dir, ns) = ns();
        let key = resource_key(Kind::Event, "absent");
        let out = ns.transact::<EventRecord, _>(&key, false, |_| ()).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn last_handle_wipes_record() {
        let (_dir, ns) = ns();
        let ev = NamedEvent::create(&ns, "gone").unwrap();
        ev.set().unwrap();
        let key = ev.handle.key.clone();
        drop(ev);
        let out = ns
            .transact::<EventRecord, _>(&key, false, |rec| *rec)
            .unwrap();
        assert!(out.is_none() || out == Some(EventRecord::default()));
    }

    #[test]
    fn ref_count_tracks_handles() {
        let (_dir, ns) = ns();
        let a = NamedEvent::create(&ns, "rc").unwrap();
        let b = NamedEvent::create(&ns, "rc").unwrap();
        let key = a.handle.key.clone();
        let count = |ns: &Namespace| {
            ns.transact::<EventRecord, _>(&key, false, |r| r.header.ref_count)
                .unwrap()
        };
        assert_eq!(count(&ns), Some(2));
        drop(b);
        assert_eq!(count(&ns), Some(1));
        drop(a);
    }

    #[test]
    fn is_set_leaves_record_untouched() {
        let (dir, ns) = ns();
        let ev = NamedEvent::create(&ns, "quiet").unwrap();
        ev.set().unwrap();
        let key = ev.handle.key.clone();
        let stale = now_ms().wrapping_sub(10_000);
        ns.transact::<EventRecord, _>(&key, false, |r| r.header.ttl = stale)
            .unwrap();
        let mtime = || std::fs::metadata(dir.path().join(&key)).unwrap().modified().unwrap();
        let before = mtime();
        std::thread::sleep(Duration::from_millis(20));

        assert!(ev.is_set().unwrap());
        assert!(ev.is_set().unwrap());

        let ttl = ns.transact::<EventRecord, _>(&key, false, |r| r.header.ttl).unwrap();
        assert_eq!(ttl, Some(stale));
        assert_eq!(mtime(), before);
    }

    #[test]
    fn refresh_restamps_and_is_rate_limited() {
        let (_dir, ns) = ns();
        let m = NamedMutex::create(&ns, "fresh").unwrap();
        assert!(m.try_lock(Duration::ZERO).unwrap());
        let key = m.handle.key.clone();
        ns.transact::<MutexRecord, _>(&key, false, |r| {
            r.header.ttl = now_ms().wrapping_sub(20_000);
            r.lock_ttl = r.header.ttl;
        })
        .unwrap();
        ns.refresh();
        let (ttl, lock_ttl) = ns
            .transact::<MutexRecord, _>(&key, false, |r| (r.header.ttl, r.lock_ttl))
            .unwrap()
            .unwrap();
        assert!(age(now_ms(), ttl) < 1_000);
        assert!(age(now_ms(), lock_ttl) < 1_000);

        // A second refresh right away is skipped.
        let old = now_ms().wrapping_sub(20_000);
        ns.transact::<MutexRecord, _>(&key, false, |r| r.header.ttl = old)
            .unwrap();
        ns.refresh();
        let ttl = ns
            .transact::<MutexRecord, _>(&key, false, |r| r.header.ttl)
            .unwrap()
            .unwrap();
        assert_eq!(ttl, old);
    }

    #[test]
    fn shutdown_joins_threads() {
        let (_dir, ns) = ns();
        ns.shutdown();
        assert!(ns.threads.lock().unwrap().is_empty());
        // Handles keep working without the background threads.
        let ev = NamedEvent::create(&ns, "after").unwrap();
        ev.set().unwrap();
        assert!(ev.is_set().unwrap());
    }
}
