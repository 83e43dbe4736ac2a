//! Cross-process exclusive access with priority interruption.
//!
//! An [`ExclusiveSession`] owns one thread that creates, locks and finally
//! releases every named primitive for a resource, so the lock is always
//! released by the thread that took it. Callers talk to it through a
//! channel (startup result) and a local close event.
//!
//! Names used for a resource prefix `P`:
//!
//! | name                  | kind  | meaning                                  |
//! |-----------------------|-------|------------------------------------------|
//! | `P.event`             | event | "someone wants the device"               |
//! | `P.mutex`             | mutex | the exclusive lock                       |
//! | `P.transient`         | mutex | the holder will let go soon              |
//! | `P.interruptible.<n>` | mutex | holder at priority `n` may be asked      |
//! | `P.request.<n>`       | mutex | a waiter at priority `n` wants in        |
//!
//! Marker mutexes are never locked; only their existence matters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::config::{OpenConfiguration, Priority};
use crate::error::{HidportError, Result};
use crate::events::{ObserverId, Observers};
use crate::sync::{LocalEvent, NamedEvent, NamedMutex, SystemEvents, WAIT_TICK, Waitable};

/// Named-primitive prefix for a device path.
pub fn resource_prefix(path: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, path.as_bytes());
    format!("hidport.{}", &URL_SAFE_NO_PAD.encode(digest.as_ref())[..22])
}

#[derive(Debug, Clone)]
pub struct ResourceNames {
    prefix: String,
}

impl ResourceNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        ResourceNames {
            prefix: prefix.into(),
        }
    }

    pub fn event(&self) -> String {
        format!("{}.event", self.prefix)
    }

    pub fn mutex(&self) -> String {
        format!("{}.mutex", self.prefix)
    }

    pub fn transient(&self) -> String {
        format!("{}.transient", self.prefix)
    }

    pub fn interruptible(&self, p: Priority) -> String {
        format!("{}.interruptible.{}", self.prefix, p.ordinal())
    }

    pub fn request(&self, p: Priority) -> String {
        format!("{}.request.{}", self.prefix, p.ordinal())
    }
}

/// Everything the session thread holds between acquire and close.
struct Held {
    event: NamedEvent,
    mutex: NamedMutex,
    request: Option<NamedMutex>,
    transient: Option<NamedMutex>,
    interruptible: Option<NamedMutex>,
}

impl Held {
    /// Release in order: request marker, transient marker, interruptible
    /// marker, the lock, the exclusive mutex, the exclusive event.
    fn release(self) {
        let Held {
            event,
            mutex,
            request,
            transient,
            interruptible,
        } = self;
        drop(request);
        drop(transient);
        drop(interruptible);
        if mutex.is_locked_by_me()
            && let Err(e) = mutex.unlock()
        {
            log::warn!("exclusive: unlock failed: {e}");
        }
        drop(mutex);
        drop(event);
    }
}

/// A held exclusive lock on one device.
pub struct ExclusiveSession {
    device: String,
    close: Arc<LocalEvent>,
    interrupt: Arc<Observers<()>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ExclusiveSession {
    /// Acquire the exclusive lock for `device`, waiting for an interruptible
    /// or transient holder as configured. Blocks until acquired or failed.
    pub fn start(ctx: &SystemEvents, device: &str, config: &OpenConfiguration) -> Result<Self> {
        Self::start_named(ctx, ResourceNames::new(resource_prefix(device)), device, config)
    }

    pub fn start_named(
        ctx: &SystemEvents,
        names: ResourceNames,
        device: &str,
        config: &OpenConfiguration,
    ) -> Result<Self> {
        if ctx.is_locally_locked(&names.mutex()) {
            return Err(HidportError::in_use(device));
        }
        let close = Arc::new(ctx.local_event()?);
        let interrupt = Arc::new(Observers::new());
        let (started_tx, started_rx) = mpsc::channel();

        let thread = {
            let ctx = ctx.clone();
            let close = Arc::clone(&close);
            let interrupt = Arc::clone(&interrupt);
            let config = config.clone();
            let device = device.to_string();
            std::thread::Builder::new()
                .name("hidport-exclusive".into())
                .spawn(move || {
                    run(&ctx, &names, &config, &device, &close, &interrupt, started_tx)
                })?
        };

        let started = started_rx.recv().unwrap_or_else(|_| {
            Err(HidportError::InvalidOperation(
                "exclusive session thread exited during startup".into(),
            ))
        });
        if let Err(e) = started {
            let _ = thread.join();
            return Err(e);
        }
        log::debug!("{device}: exclusive lock acquired");
        Ok(ExclusiveSession {
            device: device.to_string(),
            close,
            interrupt,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }

    /// Another process with higher priority asked for the device. Fires on a
    /// worker thread; the lock is kept until the session is closed.
    pub fn on_interrupt_requested(&self, f: impl Fn() + Send + Sync + 'static) -> ObserverId {
        self.interrupt.add(move |_| f())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release every named primitive. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close.set();
        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(t) = thread {
            if t.thread().id() == std::thread::current().id() {
                return;
            }
            if t.join().is_err() {
                log::warn!("{}: exclusive session thread panicked", self.device);
            }
        }
        log::debug!("{}: exclusive lock released", self.device);
    }
}

impl Drop for ExclusiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn wait_time(ms: u32) -> Duration {
    Duration::from_millis(ms as u64)
}

/// Starting phase. Returns the held primitives or the reason we gave up.
fn acquire(
    ctx: &SystemEvents,
    names: &ResourceNames,
    config: &OpenConfiguration,
    device: &str,
) -> Result<Held> {
    let event = ctx.create_event(&names.event())?;
    let mutex = ctx.create_mutex(&names.mutex())?;
    let mut request = None;

    let lock = |timeout: Duration| match mutex.try_lock(timeout) {
        // Another session of this context got there first.
        Err(HidportError::InvalidOperation(_)) => Err(HidportError::in_use(device)),
        other => other,
    };

    if !lock(Duration::ZERO)? {
        let interruptible = config
            .priority
            .below()
            .any(|p| ctx.mutex_may_exist(&names.interruptible(p)));
        let transient = ctx.mutex_may_exist(&names.transient());
        log::debug!(
            "{device}: busy (interruptible holder: {interruptible}, transient: {transient})"
        );

        request = Some(ctx.create_mutex(&names.request(config.priority))?);
        event.set()?;

        let wait = if transient {
            wait_time(config.timeout_if_transient)
        } else if interruptible {
            wait_time(config.timeout_if_interruptible)
        } else {
            Duration::ZERO
        };
        if !lock(wait)? {
            drop(request);
            return Err(HidportError::in_use(device));
        }
    }

    event.reset()?;
    let transient = if config.transient {
        Some(ctx.create_mutex(&names.transient())?)
    } else {
        None
    };
    let interruptible = if config.interruptible {
        Some(ctx.create_mutex(&names.interruptible(config.priority))?)
    } else {
        None
    };
    Ok(Held {
        event,
        mutex,
        request,
        transient,
        interruptible,
    })
}

fn run(
    ctx: &SystemEvents,
    names: &ResourceNames,
    config: &OpenConfiguration,
    device: &str,
    close: &LocalEvent,
    interrupt: &Arc<Observers<()>>,
    started: mpsc::Sender<Result<()>>,
) {
    let held = match acquire(ctx, names, config, device) {
        Ok(held) => held,
        Err(e) => {
            let _ = started.send(Err(e));
            return;
        }
    };
    if started.send(Ok(())).is_err() {
        held.release();
        return;
    }

    // Monitoring
    loop {
        let items = [Waitable::Local(close), Waitable::Named(&held.event)];
        match ctx.wait_any(&items, None) {
            Ok(Some(0)) => break,
            Ok(Some(_)) => {
                if let Err(e) = held.event.reset() {
                    log::debug!("{device}: exclusive event reset failed: {e}");
                }
                let wanted = config.interruptible
                    && config
                        .priority
                        .above()
                        .any(|p| ctx.mutex_may_exist(&names.request(p)));
                if wanted {
                    log::debug!("{device}: higher-priority open requested");
                    let interrupt = Arc::clone(interrupt);
                    let spawned = std::thread::Builder::new()
                        .name("hidport-interrupt".into())
                        .spawn(move || interrupt.notify(&()));
                    if let Err(e) = spawned {
                        log::warn!("{device}: could not dispatch interrupt: {e}");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::debug!("{device}: exclusive wait failed: {e}");
                std::thread::sleep(WAIT_TICK);
            }
        }
    }

    // Closing
    held.release();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoErrorKind;
    use crate::sync::tests::{context, namespace};
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn names() -> ResourceNames {
        ResourceNames::new("test.dev")
    }

    fn start(ctx: &SystemEvents, config: &OpenConfiguration) -> Result<ExclusiveSession> {
        ExclusiveSession::start_named(ctx, names(), "test-dev", config)
    }

    // ── Names ──

    #[test]
    fn prefix_is_stable_per_path() {
        let a = resource_prefix("/dev/hidraw0");
        assert_eq!(a, resource_prefix("/dev/hidraw0"));
        assert_ne!(a, resource_prefix("/dev/hidraw1"));
        assert!(a.starts_with("hidport."));
    }

    #[test]
    fn marker_names_carry_priority() {
        let n = names();
        assert_eq!(n.interruptible(Priority::High), "test.dev.interruptible.4");
        assert_eq!(n.request(Priority::Idle), "test.dev.request.0");
    }

    // ── Acquire ──

    #[test]
    fn uncontended_open_succeeds_and_close_releases() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let s = start(&a, &OpenConfiguration::exclusive()).unwrap();
        s.close();
        s.close();
        assert!(s.is_closed());
        start(&b, &OpenConfiguration::exclusive()).unwrap();
    }

    #[test]
    fn second_open_fails_immediately_when_not_interruptible() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let _held = start(&a, &OpenConfiguration::exclusive()).unwrap();

        let started = Instant::now();
        let err = start(&b, &OpenConfiguration::exclusive()).err().unwrap();
        assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn same_context_duplicate_is_sharing_violation() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let _held = start(&a, &OpenConfiguration::exclusive()).unwrap();
        let err = start(&a, &OpenConfiguration::exclusive()).err().unwrap();
        assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));
    }

    #[test]
    fn markers_exist_while_held() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let config = OpenConfiguration::exclusive()
            .with_interruptible(true)
            .with_transient(true)
            .with_priority(Priority::Low);
        let s = start(&a, &config).unwrap();
        assert!(b.mutex_may_exist(&names().transient()));
        assert!(b.mutex_may_exist(&names().interruptible(Priority::Low)));
        s.close();
        assert!(!b.mutex_may_exist(&names().transient()));
        assert!(!b.mutex_may_exist(&names().interruptible(Priority::Low)));
        assert!(!b.mutex_may_exist(&names().mutex()));
    }

    // ── Interruption ──

    #[test]
    fn holder_is_interrupted_and_waiter_gets_device() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let holder = Arc::new(
            start(&a, &OpenConfiguration::exclusive().with_interruptible(true)).unwrap(),
        );
        let interrupts = Arc::new(AtomicU32::new(0));
        {
            let interrupts = Arc::clone(&interrupts);
            let weak = Arc::downgrade(&holder);
            holder.on_interrupt_requested(move || {
                interrupts.fetch_add(1, Ordering::SeqCst);
                if let Some(h) = weak.upgrade() {
                    h.close();
                }
            });
        }

        let config = OpenConfiguration::exclusive()
            .with_priority(Priority::High)
            .with_timeouts(500, 30_000);
        let s = start(&b, &config).unwrap();
        assert!(interrupts.load(Ordering::SeqCst) >= 1);
        assert!(holder.is_closed());
        s.close();
    }

    #[test]
    fn waiter_gives_up_when_holder_ignores_interrupt() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let holder = start(&a, &OpenConfiguration::exclusive().with_interruptible(true)).unwrap();
        let interrupted = Arc::new(AtomicU32::new(0));
        let i = Arc::clone(&interrupted);
        holder.on_interrupt_requested(move || {
            i.fetch_add(1, Ordering::SeqCst);
        });

        let config = OpenConfiguration::exclusive()
            .with_priority(Priority::High)
            .with_timeouts(500, 30_000);
        let started = Instant::now();
        let err = start(&b, &config).err().unwrap();
        let waited = started.elapsed();
        assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));
        assert!(waited >= Duration::from_millis(450), "{waited:?}");
        assert!(waited < Duration::from_millis(3000), "{waited:?}");
        assert!(interrupted.load(Ordering::SeqCst) >= 1);
        assert!(!holder.is_closed());
    }

    #[test]
    fn equal_priority_does_not_interrupt() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let holder = start(&a, &OpenConfiguration::exclusive().with_interruptible(true)).unwrap();
        let interrupted = Arc::new(AtomicU32::new(0));
        let i = Arc::clone(&interrupted);
        holder.on_interrupt_requested(move || {
            i.fetch_add(1, Ordering::SeqCst);
        });

        let started = Instant::now();
        assert!(start(&b, &OpenConfiguration::exclusive()).is_err());
        assert!(started.elapsed() < Duration::from_millis(1000));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(interrupted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transient_holder_is_waited_for() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let holder = start(&a, &OpenConfiguration::exclusive().with_transient(true)).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(300));
                holder.close();
            });
            let config = OpenConfiguration::exclusive().with_timeouts(0, 5_000);
            let started = Instant::now();
            let session = start(&b, &config).unwrap();
            assert!(started.elapsed() >= Duration::from_millis(250));
            session.close();
        });
    }
}
