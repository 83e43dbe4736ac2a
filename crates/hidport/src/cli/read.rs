//! `read` subcommand — print input reports from a HID device.

use std::path::Path;

use super::{
    DeviceStream, OpenArgs, ReportJson, Result, Timeout, context, hex, print_json,
};

pub(super) fn cmd_read(
    custom_path: Option<&Path>,
    path: &str,
    count: usize,
    timeout: Timeout,
    open: &OpenArgs,
    json: bool,
) -> Result<()> {
    let ctx = context(custom_path)?;
    let config = open.configuration(&ctx.settings().open);
    let stream = ctx.open_hid_path(path, &config)?;
    stream.set_read_timeout(timeout);
    stream.on_interrupt_requested(Box::new(|| {
        log::warn!("another process asked for the device");
    }));

    let mut buf = vec![0u8; stream.max_input_report_len().max(64)];
    let mut reports = Vec::new();
    for index in 0..count {
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.is_timeout() => {
                log::warn!("no report within {timeout}");
                break;
            }
            Err(e) => return Err(e),
        };
        let bytes = &buf[..n];
        if json {
            reports.push(ReportJson {
                index,
                len: n,
                hex: hex(bytes),
            });
        } else {
            println!("[{index}] {n:>3} bytes: {}", hex(bytes));
        }
    }
    stream.close();

    if json {
        print_json(&reports)?;
    }
    Ok(())
}
