//! Integration tests: cross-process exclusive opens through the public API.
//!
//! Two `Context`s over one temporary namespace stand in for two processes.
//! Streams are backed by the in-crate mock HID backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use hidport_lib::error::IoErrorKind;
use hidport_lib::hid::mock::{MockHidBackend, MockHidControl};
use hidport_lib::open::{open_with, try_open_with};
use hidport_lib::sync::SystemEvents;
use hidport_lib::{Context, DeviceStream, HidStream, OpenConfiguration, Priority, Settings, Timeout};

const DEVICE: &str = "/dev/hidraw-integration";

/// Two contexts that share a fresh namespace.
fn two_processes() -> (tempfile::TempDir, Context, Context) {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("/i{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);
    let make = || {
        let events = SystemEvents::with_namespace(dir.path(), &prefix).unwrap();
        Context::with_events(Settings::default(), events)
    };
    let (a, b) = (make(), make());
    (dir, a, b)
}

fn open(
    ctx: &Context,
    config: &OpenConfiguration,
) -> hidport_lib::error::Result<(HidStream, MockHidControl)> {
    let mut control = None;
    let stream = open_with(ctx.events(), DEVICE, config, || {
        let (backend, c) = MockHidBackend::new(DEVICE);
        control = Some(c);
        HidStream::start(Box::new(backend))
    })?;
    Ok((stream, control.unwrap()))
}

// ── Exclusivity ──

#[test]
fn second_exclusive_open_fails_fast_then_succeeds_after_close() {
    let (_dir, a, b) = two_processes();
    let (first, _) = open(&a, &OpenConfiguration::exclusive()).unwrap();

    let started = Instant::now();
    let err = open(&b, &OpenConfiguration::exclusive()).err().unwrap();
    assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));
    assert!(started.elapsed() < Duration::from_secs(1));

    first.close();
    let (second, _) = open(&b, &OpenConfiguration::exclusive()).unwrap();
    second.close();
}

#[test]
fn exclusive_stream_still_does_io() {
    let (_dir, a, _b) = two_processes();
    let (stream, control) = open(&a, &OpenConfiguration::exclusive()).unwrap();
    stream.set_read_timeout(Timeout::Millis(1000));

    control.push_input(vec![0, 0x42]);
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0, 0x42]);

    stream.write(&[0, 1, 2]).unwrap();
    assert_eq!(control.written(), vec![vec![0, 1, 2]]);
}

// ── Interruption ──

#[test]
fn high_priority_open_interrupts_cooperative_holder() {
    let (_dir, a, b) = two_processes();
    let holder_config = OpenConfiguration::exclusive()
        .with_interruptible(true)
        .with_priority(Priority::Low);
    let (holder, _) = open(&a, &holder_config).unwrap();
    let holder = Arc::new(holder);

    let interrupts = Arc::new(AtomicU32::new(0));
    {
        let interrupts = Arc::clone(&interrupts);
        let weak = Arc::downgrade(&holder);
        holder.on_interrupt_requested(Box::new(move || {
            interrupts.fetch_add(1, Ordering::SeqCst);
            if let Some(h) = weak.upgrade() {
                h.close();
            }
        }));
    }

    let closed = Arc::new(AtomicU32::new(0));
    {
        let closed = Arc::clone(&closed);
        holder.on_closed(Box::new(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let waiter_config = OpenConfiguration::exclusive()
        .with_priority(Priority::High)
        .with_timeouts(3000, 30_000);
    let (stream, _) = open(&b, &waiter_config).unwrap();
    assert!(interrupts.load(Ordering::SeqCst) >= 1);
    // The lock is released by the first `closed` observer; ours runs right after.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    stream.close();
}

#[test]
fn stubborn_holder_makes_waiter_time_out() {
    let (_dir, a, b) = two_processes();
    let (holder, _) = open(&a, &OpenConfiguration::exclusive().with_interruptible(true)).unwrap();

    let config = OpenConfiguration::exclusive()
        .with_priority(Priority::VeryHigh)
        .with_timeouts(400, 30_000);
    let started = Instant::now();
    let err = open(&b, &config).err().unwrap();
    assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));
    assert!(started.elapsed() >= Duration::from_millis(350));
    assert!(!holder.is_closed());
}

#[test]
fn lower_priority_does_not_interrupt() {
    let (_dir, a, b) = two_processes();
    let (holder, _) = open(
        &a,
        &OpenConfiguration::exclusive()
            .with_interruptible(true)
            .with_priority(Priority::High),
    )
    .unwrap();
    let interrupts = Arc::new(AtomicU32::new(0));
    let i = Arc::clone(&interrupts);
    holder.on_interrupt_requested(Box::new(move || {
        i.fetch_add(1, Ordering::SeqCst);
    }));

    let err = open(&b, &OpenConfiguration::exclusive().with_priority(Priority::Idle))
        .err()
        .unwrap();
    assert_eq!(err.io_kind(), Some(IoErrorKind::SharingViolation));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(interrupts.load(Ordering::SeqCst), 0);
}

// ── Transient holders ──

#[test]
fn transient_holder_is_awaited() {
    let (_dir, a, b) = two_processes();
    let (holder, _) = open(&a, &OpenConfiguration::exclusive().with_transient(true)).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(300));
            holder.close();
        });
        let (stream, _) = open(&b, &OpenConfiguration::exclusive().with_timeouts(0, 5000)).unwrap();
        stream.close();
    });
}

// ── try_open ──

#[test]
fn try_open_reports_panics_as_errors() {
    let (_dir, a, b) = two_processes();
    let result: hidport_lib::error::Result<HidStream> =
        try_open_with(a.events(), DEVICE, &OpenConfiguration::exclusive(), || {
            panic!("driver fell over")
        });
    assert!(result.is_err());
    let (stream, _) = open(&b, &OpenConfiguration::exclusive()).unwrap();
    stream.close();
}
