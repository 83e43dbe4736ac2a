//! `config` subcommand — show the settings file and effective values.

use std::path::Path;

use super::{ConfigOutput, Result, Settings, kv, kv_width, print_json};

pub(super) fn cmd_config(custom_path: Option<&Path>, json: bool) -> Result<()> {
    let settings = super::load_settings(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Settings::path);
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match settings.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        return print_json(&ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings,
            problems,
        });
    }

    let w = kv_width(&[
        "Config file:",
        "read_timeout_ms:",
        "write_timeout_ms:",
        "poll_interval_ms:",
        "sync_dir:",
        "open.timeout_if_interruptible:",
    ]);

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv("read_timeout_ms:", settings.read_timeout(), w);
    kv("write_timeout_ms:", settings.write_timeout(), w);
    kv("poll_interval_ms:", settings.poll_interval_ms, w);
    let sync_dir = settings
        .sync_dir()
        .unwrap_or_else(hidport_lib::sync::default_dir);
    kv("sync_dir:", sync_dir.display(), w);
    kv("open.exclusive:", settings.open.exclusive, w);
    kv("open.priority:", settings.open.priority, w);
    kv("open.interruptible:", settings.open.interruptible, w);
    kv("open.transient:", settings.open.transient, w);
    kv(
        "open.timeout_if_interruptible:",
        format_args!("{} ms", settings.open.timeout_if_interruptible),
        w,
    );
    kv(
        "open.timeout_if_transient:",
        format_args!("{} ms", settings.open.timeout_if_transient),
        w,
    );

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}
