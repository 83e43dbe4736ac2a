//! Stream open protocol: optional exclusive lock, then the OS open.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::config::OpenConfiguration;
use crate::error::{HidportError, Result};
use crate::exclusive::ExclusiveSession;
use crate::stream::DeviceStream;
use crate::sync::SystemEvents;

/// Open `device` with `open_fn`, taking the exclusive lock first when
/// `config.exclusive` is set.
///
/// The lock is released when the stream closes, or immediately if the OS
/// open fails. Interrupt requests for the lock are forwarded to the
/// stream's `interrupt_requested` observers.
pub fn open_with<S: DeviceStream>(
    events: &SystemEvents,
    device: &str,
    config: &OpenConfiguration,
    open_fn: impl FnOnce() -> Result<S>,
) -> Result<S> {
    if !config.exclusive {
        return open_fn();
    }

    let session = Arc::new(ExclusiveSession::start(events, device, config)?);
    let stream = match open_fn() {
        Ok(s) => s,
        Err(e) => {
            session.close();
            return Err(e);
        }
    };

    let forward = Arc::downgrade(stream.events());
    session.on_interrupt_requested(move || {
        if let Some(events) = forward.upgrade() {
            events.interrupt_requested.notify(&());
        }
    });
    let owned = Arc::clone(&session);
    stream.events().closed.add(move |_| owned.close());

    // A stream closed between the open and the observer registration never
    // fires `closed` again.
    if stream.is_closed() {
        session.close();
    }
    Ok(stream)
}

/// [`open_with`] that turns a backend panic into an error.
pub fn try_open_with<S: DeviceStream>(
    events: &SystemEvents,
    device: &str,
    config: &OpenConfiguration,
    open_fn: impl FnOnce() -> Result<S>,
) -> Result<S> {
    match catch_unwind(AssertUnwindSafe(|| open_with(events, device, config, open_fn))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic_message(&*panic);
            log::warn!("{device}: open panicked: {msg}");
            Err(HidportError::InvalidOperation(format!(
                "{device}: open panicked: {msg}"
            )))
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Priority;
    use crate::error::IoErrorKind;
    use crate::hid::HidStream;
    use crate::hid::mock::MockHidBackend;
    use crate::sync::tests::{context, namespace};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const DEV: &str = "/dev/hidraw-test";

    fn open_mock(ctx: &SystemEvents, config: &OpenConfiguration) -> Result<HidStream> {
        open_with(ctx, DEV, config, || {
            let (backend, _control) = MockHidBackend::new(DEV);
            HidStream::start(Box::new(backend))
        })
    }

    // ── Plain open ──

    #[test]
    fn non_exclusive_opens_share() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let s1 = open_mock(&a, &OpenConfiguration::default()).unwrap();
        let s2 = open_mock(&b, &OpenConfiguration::default()).unwrap();
        s1.close();
        s2.close();
    }

    // ── Exclusive ──

    #[test]
    fn exclusive_open_blocks_second_until_close() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let s1 = open_mock(&a, &OpenConfiguration::exclusive()).unwrap();
        let err = open_mock(&b, &OpenConfiguration::exclusive()).err().unwrap();
        assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));

        s1.close();
        let s2 = open_mock(&b, &OpenConfiguration::exclusive()).unwrap();
        s2.close();
    }

    #[test]
    fn dropping_stream_releases_lock() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        drop(open_mock(&a, &OpenConfiguration::exclusive()).unwrap());
        open_mock(&b, &OpenConfiguration::exclusive()).unwrap();
    }

    #[test]
    fn failed_os_open_releases_lock() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let err = open_with(&a, DEV, &OpenConfiguration::exclusive(), || {
            Err::<HidStream, _>(HidportError::NotFound(DEV.into()))
        })
        .err()
        .unwrap();
        assert!(matches!(err, HidportError::NotFound(_)));
        open_mock(&b, &OpenConfiguration::exclusive()).unwrap();
    }

    #[test]
    fn interrupt_is_forwarded_to_stream() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let b = context(&dir, &prefix);
        let holder = Arc::new(
            open_mock(&a, &OpenConfiguration::exclusive().with_interruptible(true)).unwrap(),
        );
        let interrupts = Arc::new(AtomicU32::new(0));
        {
            let interrupts = Arc::clone(&interrupts);
            let weak = Arc::downgrade(&holder);
            holder.on_interrupt_requested(Box::new(move || {
                interrupts.fetch_add(1, Ordering::SeqCst);
                if let Some(s) = weak.upgrade() {
                    s.close();
                }
            }));
        }

        let config = OpenConfiguration::exclusive()
            .with_priority(Priority::VeryHigh)
            .with_timeouts(2000, 30_000);
        let s = open_mock(&b, &config).unwrap();
        assert!(interrupts.load(Ordering::SeqCst) >= 1);
        assert!(holder.is_closed());
        s.close();
    }

    // ── try_open ──

    #[test]
    fn try_open_turns_panic_into_error() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let result: Result<HidStream> =
            try_open_with(&a, DEV, &OpenConfiguration::exclusive(), || panic!("backend exploded"));
        let err = result.err().unwrap();
        assert!(err.to_string().contains("backend exploded"), "{err}");

        // The lock taken before the panic is not leaked.
        std::thread::sleep(Duration::from_millis(50));
        let b = context(&dir, &prefix);
        open_mock(&b, &OpenConfiguration::exclusive()).unwrap();
    }

    #[test]
    fn try_open_passes_errors_through() {
        let (dir, prefix) = namespace();
        let a = context(&dir, &prefix);
        let result: Result<HidStream> = try_open_with(&a, DEV, &OpenConfiguration::default(), || {
            Err(HidportError::Unsupported("no backend".into()))
        });
        assert!(matches!(result, Err(HidportError::Unsupported(_))));
    }
}
