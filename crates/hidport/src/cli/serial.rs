//! `serial` subcommand — configure a port, optionally send text, print what comes back.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use hidport_lib::SerialSettings;

use super::{DeviceStream, OpenArgs, RUNNING, Result, Timeout, context, hex};

/// Read slice used while listening, so Ctrl+C is noticed promptly.
const LISTEN_SLICE_MS: u32 = 100;

/// Expand `\r`, `\n`, `\t` and `\\` escapes.
pub(super) fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub(super) fn cmd_serial(
    custom_path: Option<&Path>,
    port: &str,
    settings: SerialSettings,
    send: Option<&str>,
    listen: Duration,
    open: &OpenArgs,
) -> Result<()> {
    let ctx = context(custom_path)?;
    let config = open.configuration(&ctx.settings().open);
    let stream = ctx.open_serial_path(port, &config)?;
    stream.set_settings(settings)?;
    println!("[port] {port} {settings}");

    if let Some(text) = send {
        let bytes = unescape(text).into_bytes();
        stream.write(&bytes)?;
        println!("[sent] {} bytes", bytes.len());
    }

    stream.set_read_timeout(Timeout::Millis(LISTEN_SLICE_MS));
    let started = Instant::now();
    let mut buf = [0u8; 256];
    while RUNNING.load(Ordering::SeqCst) && started.elapsed() < listen {
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                let bytes = &buf[..n];
                match std::str::from_utf8(bytes) {
                    Ok(text) => print!("{text}"),
                    Err(_) => println!("[recv] {}", hex(bytes)),
                }
            }
            Err(e) if e.is_timeout() => {}
            Err(e) => return Err(e),
        }
    }
    stream.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_expands_line_endings() {
        assert_eq!(unescape("AT\\r\\n"), "AT\r\n");
        assert_eq!(unescape("a\\tb"), "a\tb");
        assert_eq!(unescape("back\\\\slash"), "back\\slash");
    }

    #[test]
    fn unescape_keeps_unknown_escapes() {
        assert_eq!(unescape("\\x41"), "\\x41");
        assert_eq!(unescape("end\\"), "end\\");
        assert_eq!(unescape("plain"), "plain");
    }
}
