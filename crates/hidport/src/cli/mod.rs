//! CLI subcommands: enumeration, raw report I/O, serial, exclusive locks.

mod config_cmd;
mod devices;
mod feature;
mod lock;
mod read;
mod serial;
mod watch;
mod write;

use std::path::Path;
use std::time::Duration;

use clap::{Subcommand, ValueEnum};
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use hidport_lib::config::{OpenConfiguration, Priority, Settings};
pub(super) use hidport_lib::context::Context;
pub(super) use hidport_lib::error::{HidportError, Result};
pub(super) use hidport_lib::stream::{DeviceStream, Timeout};

const PADDING: usize = 2;

/// Alignment width for key-value output: the longest key plus padding.
pub(super) fn kv_width(keys: &[&str]) -> usize {
    keys.iter().map(|k| k.len()).max().map_or(0, |m| m + PADDING)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| HidportError::InvalidOperation(format!("JSON encoding failed: {e}")))?;
    println!("{text}");
    Ok(())
}

/// Space-separated lowercase hex.
pub(super) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex bytes; spaces, colons and an optional `0x` prefix are ignored.
pub(super) fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let t = text.trim();
    let t = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    let digits: String = t
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(HidportError::InvalidOperation(format!(
            "'{text}' is not an even number of hex digits"
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| HidportError::InvalidOperation(format!("'{text}' is not valid hex")))
        })
        .collect()
}

/// Settings from `custom_path` or the default location, warnings logged.
pub(super) fn load_settings(custom_path: Option<&Path>) -> Settings {
    let (settings, warnings) = match custom_path {
        Some(p) => Settings::load_from(p),
        None => Settings::load_with_warnings(),
    };
    for w in &warnings {
        log::warn!("[config] {w}");
    }
    settings
}

pub(super) fn context(custom_path: Option<&Path>) -> Result<Context> {
    Context::init(load_settings(custom_path))
}

/// Timeout flag value: negative means wait forever.
pub(super) fn timeout_arg(ms: i64) -> Timeout {
    Timeout::from_millis(ms)
}

/// Sleep in short slices until Ctrl+C or `done` returns true.
pub(super) fn wait_until(mut done: impl FnMut() -> bool, limit: Option<Duration>) {
    let started = std::time::Instant::now();
    while RUNNING.load(std::sync::atomic::Ordering::SeqCst) && !done() {
        if limit.is_some_and(|l| started.elapsed() >= l) {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

// ── Argument types ──

#[derive(Clone, Copy, ValueEnum)]
pub enum ParityArg {
    None,
    Odd,
    Even,
}

impl From<ParityArg> for hidport_lib::Parity {
    fn from(p: ParityArg) -> Self {
        match p {
            ParityArg::None => hidport_lib::Parity::None,
            ParityArg::Odd => hidport_lib::Parity::Odd,
            ParityArg::Even => hidport_lib::Parity::Even,
        }
    }
}

/// Exclusive-open flags shared by the device commands.
#[derive(clap::Args, Clone)]
pub struct OpenArgs {
    /// Take the cross-process exclusive lock
    #[arg(long)]
    exclusive: bool,

    /// Priority used for interruption (idle, very-low, low, normal, high, very-high)
    #[arg(long)]
    priority: Option<Priority>,

    /// Let higher-priority openers ask for the device
    #[arg(long)]
    interruptible: bool,

    /// Announce a short hold
    #[arg(long)]
    transient: bool,
}

impl OpenArgs {
    pub(super) fn configuration(&self, defaults: &OpenConfiguration) -> OpenConfiguration {
        OpenConfiguration {
            exclusive: self.exclusive || defaults.exclusive,
            interruptible: self.interruptible || defaults.interruptible,
            priority: self.priority.unwrap_or(defaults.priority),
            transient: self.transient || defaults.transient,
            ..defaults.clone()
        }
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub platform: hidport_lib::Platform,
    pub count: usize,
    pub devices: Vec<hidport_lib::DeviceInfo>,
}

#[derive(Serialize)]
pub(super) struct ReportJson {
    pub index: usize,
    pub len: usize,
    pub hex: String,
}

#[derive(Serialize)]
pub(super) struct ChangeJson {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Settings,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List HID and serial devices
    Devices {
        /// Only HID devices
        #[arg(long, conflicts_with = "serial")]
        hid: bool,
        /// Only serial ports
        #[arg(long)]
        serial: bool,
    },

    /// Print device arrivals and removals until Ctrl+C
    Watch,

    /// Read input reports from a HID device
    Read {
        /// Device path (e.g. /dev/hidraw0)
        path: String,
        /// Number of reports to read
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Read timeout in ms (-1 waits forever)
        #[arg(long, default_value_t = 3000, allow_hyphen_values = true)]
        timeout: i64,
        #[command(flatten)]
        open: OpenArgs,
    },

    /// Write one output report to a HID device
    Write {
        path: String,
        /// Report bytes in hex, report ID first (e.g. "00 01 ff")
        data: String,
        #[command(flatten)]
        open: OpenArgs,
    },

    /// Get or set feature reports
    Feature {
        #[command(subcommand)]
        action: FeatureAction,
    },

    /// Talk to a serial port
    Serial {
        /// Port path or name (e.g. /dev/ttyUSB0, COM3)
        port: String,
        #[arg(long, default_value_t = 9600)]
        baud: u32,
        #[arg(long, default_value_t = 8)]
        data_bits: u8,
        #[arg(long, value_enum, default_value = "none")]
        parity: ParityArg,
        /// 1 or 2
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
        stop_bits: u8,
        /// Text to send (`\r` and `\n` escapes are expanded)
        #[arg(long)]
        send: Option<String>,
        /// How long to print received bytes, in ms
        #[arg(long, default_value_t = 1000)]
        listen: u64,
        #[command(flatten)]
        open: OpenArgs,
    },

    /// Hold the exclusive lock for a device without opening it
    Lock {
        path: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Release when a higher-priority process asks
        #[arg(long)]
        interruptible: bool,
        #[arg(long)]
        transient: bool,
        /// Release after this many ms instead of waiting for Ctrl+C
        #[arg(long)]
        hold: Option<u64>,
    },

    /// Show settings and the settings file location
    Config,
}

#[derive(Subcommand)]
pub enum FeatureAction {
    /// Read a feature report
    Get {
        path: String,
        /// Report ID
        id: u8,
        /// Buffer length including the ID byte
        len: usize,
    },
    /// Send a feature report (hex, report ID first)
    Set { path: String, data: String },
}

/// Warn if `--json` was passed to a command that doesn't support it.
fn warn_json_unsupported(cmd_name: &str) {
    log::warn!("--json is not supported for `{cmd_name}` (ignored)");
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices { hid, serial } => devices::cmd_devices(hid, serial, json),
        Command::Watch => watch::cmd_watch(config_path, json),
        Command::Read {
            path,
            count,
            timeout,
            open,
        } => read::cmd_read(config_path, &path, count, timeout_arg(timeout), &open, json),
        Command::Write { path, data, open } => {
            if json {
                warn_json_unsupported("write");
            }
            write::cmd_write(config_path, &path, &data, &open)
        }
        Command::Feature { action } => match action {
            FeatureAction::Get { path, id, len } => {
                feature::cmd_get(config_path, &path, id, len, json)
            }
            FeatureAction::Set { path, data } => {
                if json {
                    warn_json_unsupported("feature set");
                }
                feature::cmd_set(config_path, &path, &data)
            }
        },
        Command::Serial {
            port,
            baud,
            data_bits,
            parity,
            stop_bits,
            send,
            listen,
            open,
        } => {
            if json {
                warn_json_unsupported("serial");
            }
            let settings = hidport_lib::SerialSettings {
                baud_rate: baud,
                data_bits,
                parity: parity.into(),
                stop_bits: if stop_bits == 2 {
                    hidport_lib::StopBits::Two
                } else {
                    hidport_lib::StopBits::One
                },
            };
            serial::cmd_serial(
                config_path,
                &port,
                settings,
                send.as_deref(),
                Duration::from_millis(listen),
                &open,
            )
        }
        Command::Lock {
            path,
            priority,
            interruptible,
            transient,
            hold,
        } => {
            if json {
                warn_json_unsupported("lock");
            }
            let config = OpenConfiguration::exclusive()
                .with_priority(priority)
                .with_interruptible(interruptible)
                .with_transient(transient);
            lock::cmd_lock(config_path, &path, &config, hold.map(Duration::from_millis))
        }
        Command::Config => config_cmd::cmd_config(config_path, json),
    }
}
