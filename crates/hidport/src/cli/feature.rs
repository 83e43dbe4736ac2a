//! `feature` subcommand — get and set feature reports.

use std::path::Path;

use serde::Serialize;

use super::{
    DeviceStream, HidportError, OpenConfiguration, Result, context, hex, parse_hex, print_json,
};

#[derive(Serialize)]
struct FeatureJson {
    report_id: u8,
    len: usize,
    hex: String,
}

pub(super) fn cmd_get(
    custom_path: Option<&Path>,
    path: &str,
    id: u8,
    len: usize,
    json: bool,
) -> Result<()> {
    if len == 0 {
        return Err(HidportError::InvalidOperation(
            "feature buffer length must include the report ID byte".into(),
        ));
    }
    let ctx = context(custom_path)?;
    let stream = ctx.open_hid_path(path, &OpenConfiguration::default())?;
    let mut buf = vec![0u8; len];
    buf[0] = id;
    let n = stream.get_feature(&mut buf)?;
    stream.close();

    if json {
        return print_json(&FeatureJson {
            report_id: id,
            len: n,
            hex: hex(&buf[..n]),
        });
    }
    println!("Feature report {id:#04x} ({n} bytes): {}", hex(&buf[..n]));
    Ok(())
}

pub(super) fn cmd_set(custom_path: Option<&Path>, path: &str, data: &str) -> Result<()> {
    let bytes = parse_hex(data)?;
    let ctx = context(custom_path)?;
    let stream = ctx.open_hid_path(path, &OpenConfiguration::default())?;
    stream.set_feature(&bytes)?;
    stream.close();
    println!("Sent feature report {:#04x} ({} bytes)", bytes[0], bytes.len());
    Ok(())
}
