//! `watch` subcommand — print device arrivals and removals until Ctrl+C.

use std::path::Path;

use super::{ChangeJson, Result, context, print_json, wait_until};

pub(super) fn cmd_watch(custom_path: Option<&Path>, json: bool) -> Result<()> {
    let ctx = context(custom_path)?;
    let list = ctx.device_list()?;

    if !json {
        let n = list.devices().len();
        println!(
            "Watching {n} device{} (poll every {} ms). Press Ctrl+C to stop.",
            if n == 1 { "" } else { "s" },
            ctx.settings().poll_interval_ms
        );
    }

    list.on_changed(move |change| {
        if json {
            let out = ChangeJson {
                added: change.added.iter().map(ToString::to_string).collect(),
                removed: change.removed.iter().map(ToString::to_string).collect(),
            };
            if let Err(e) = print_json(&out) {
                log::warn!("{e}");
            }
            return;
        }
        for key in &change.added {
            println!("+ {key}");
        }
        for key in &change.removed {
            println!("- {key}");
        }
    });

    wait_until(|| false, None);
    ctx.shutdown();
    Ok(())
}
