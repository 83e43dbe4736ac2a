//! `write` subcommand — send one output report.

use std::path::Path;

use super::{DeviceStream, OpenArgs, Result, context, parse_hex};

pub(super) fn cmd_write(
    custom_path: Option<&Path>,
    path: &str,
    data: &str,
    open: &OpenArgs,
) -> Result<()> {
    let bytes = parse_hex(data)?;
    let ctx = context(custom_path)?;
    let config = open.configuration(&ctx.settings().open);
    let stream = ctx.open_hid_path(path, &config)?;
    stream.write(&bytes)?;
    stream.close();
    println!("Wrote {} byte{} to {path}", bytes.len(), if bytes.len() == 1 { "" } else { "s" });
    Ok(())
}
