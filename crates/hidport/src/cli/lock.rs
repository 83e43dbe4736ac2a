//! `lock` subcommand — hold a device's exclusive lock without opening it.
//!
//! Useful for checking how other processes react to a busy device.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hidport_lib::exclusive::ExclusiveSession;

use super::{OpenConfiguration, Result, context, kv, kv_width, wait_until};

pub(super) fn cmd_lock(
    custom_path: Option<&Path>,
    path: &str,
    config: &OpenConfiguration,
    hold: Option<Duration>,
) -> Result<()> {
    let ctx = context(custom_path)?;
    let defaults = &ctx.settings().open;
    let config = OpenConfiguration {
        timeout_if_interruptible: defaults.timeout_if_interruptible,
        timeout_if_transient: defaults.timeout_if_transient,
        ..config.clone()
    };
    let session = ExclusiveSession::start(ctx.events(), path, &config)?;

    let w = kv_width(&["Device:", "Priority:", "Interruptible:", "Transient:"]);
    println!("Holding exclusive lock:");
    kv("Device:", path, w);
    kv("Priority:", config.priority, w);
    kv("Interruptible:", config.interruptible, w);
    kv("Transient:", config.transient, w);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        session.on_interrupt_requested(move || {
            interrupted.store(true, Ordering::SeqCst);
        });
    }

    match hold {
        Some(d) => println!("Releasing in {} ms (or on Ctrl+C).", d.as_millis()),
        None => println!("Press Ctrl+C to release."),
    }
    wait_until(|| interrupted.load(Ordering::SeqCst), hold);

    if interrupted.load(Ordering::SeqCst) {
        println!("Interrupt requested by a higher-priority process, releasing.");
    }
    session.close();
    ctx.shutdown();
    println!("Released.");
    Ok(())
}
