//! Open options and the optional settings file.
//!
//! [`OpenConfiguration`] is passed to every open call. [`Settings`] is a TOML
//! file under the platform config directory holding process-wide defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stream::{DEFAULT_TIMEOUT_MS, Timeout};

/// Header comment prepended to saved settings files.
const SETTINGS_HEADER: &str =
    "# hidport settings. Changes made outside hidport may be overwritten.\n\n";

/// Upper bound for the exclusive-open wait timeouts.
const MAX_OPEN_TIMEOUT_MS: u32 = 600_000;

/// Priority of an exclusive open. Only decides whether an interrupt is
/// requested from the current holder; it never preempts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Idle,
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

impl Priority {
    pub const ALL: [Priority; 6] = [
        Priority::Idle,
        Priority::VeryLow,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::VeryHigh,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Idle => "idle",
            Priority::VeryLow => "very-low",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::VeryHigh => "very-high",
        }
    }

    pub fn below(self) -> impl Iterator<Item = Priority> {
        Self::ALL.into_iter().filter(move |p| *p < self)
    }

    pub fn above(self) -> impl Iterator<Item = Priority> {
        Self::ALL.into_iter().filter(move |p| *p > self)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|p| p.name() == norm)
            .ok_or_else(|| {
                format!(
                    "unknown priority '{s}' \
                     (expected idle, very-low, low, normal, high, very-high)"
                )
            })
    }
}

/// Options for a single open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConfiguration {
    /// Take the cross-process exclusive lock before opening.
    #[serde(default)]
    pub exclusive: bool,

    /// Let higher-priority openers ask us to give the device up.
    #[serde(default)]
    pub interruptible: bool,

    #[serde(default)]
    pub priority: Priority,

    /// How long to wait for an interruptible holder to let go.
    #[serde(default = "default_timeout_if_interruptible")]
    pub timeout_if_interruptible: u32,

    /// How long to wait for a transient holder to let go.
    #[serde(default = "default_timeout_if_transient")]
    pub timeout_if_transient: u32,

    /// Announce that we will hold the device only briefly.
    #[serde(default)]
    pub transient: bool,
}

fn default_timeout_if_interruptible() -> u32 {
    3000
}

fn default_timeout_if_transient() -> u32 {
    30000
}

impl Default for OpenConfiguration {
    fn default() -> Self {
        OpenConfiguration {
            exclusive: false,
            interruptible: false,
            priority: Priority::Normal,
            timeout_if_interruptible: default_timeout_if_interruptible(),
            timeout_if_transient: default_timeout_if_transient(),
            transient: false,
        }
    }
}

impl OpenConfiguration {
    /// Exclusive open with default priority and timeouts.
    pub fn exclusive() -> Self {
        OpenConfiguration {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_timeouts(mut self, if_interruptible_ms: u32, if_transient_ms: u32) -> Self {
        self.timeout_if_interruptible = if_interruptible_ms;
        self.timeout_if_transient = if_transient_ms;
        self
    }
}

/// Process-wide defaults loaded from `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Default stream read timeout in ms. `-1` = infinite.
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: i64,

    /// Default stream write timeout in ms. `-1` = infinite.
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: i64,

    /// Device list enumeration interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Directory for named-primitive backing files. Empty = system temp dir.
    #[serde(default)]
    pub sync_dir: String,

    /// Defaults for opens that do not pass their own configuration.
    #[serde(default)]
    pub open: OpenConfiguration,
}

fn default_timeout_ms() -> i64 {
    DEFAULT_TIMEOUT_MS as i64
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sync_dir: String::new(),
            open: OpenConfiguration::default(),
        }
    }
}

/// Problems [`Settings::validate`] can report.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A stream timeout below `-1`.
    InvalidTimeout { field: &'static str, value: i64 },
    /// `poll_interval_ms` outside 10..=60000.
    InvalidPollInterval(u64),
    /// `sync_dir` is not an absolute path.
    RelativeSyncDir(String),
    /// An `[open]` wait timeout above ten minutes.
    OpenTimeoutTooLarge { field: &'static str, value: u32 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidTimeout { field, value } => {
                write!(f, "Invalid {field}: {value} (use -1 for infinite)")
            }
            ValidationError::InvalidPollInterval(ms) => {
                write!(f, "Invalid poll_interval_ms: {ms} (must be 10..=60000)")
            }
            ValidationError::RelativeSyncDir(dir) => {
                write!(f, "sync_dir must be an absolute path: {dir}")
            }
            ValidationError::OpenTimeoutTooLarge { field, value } => {
                write!(f, "open.{field} too large: {value} ms (max {MAX_OPEN_TIMEOUT_MS})")
            }
        }
    }
}

impl Settings {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hidport"))
    }

    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load settings from disk, logging parse problems.
    pub fn load() -> Self {
        let (settings, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        settings
    }

    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Returns `(defaults, [])` if the file doesn't exist and
    /// `(defaults, [warning])` if it can't be parsed.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => (settings, vec![]),
                Err(e) => {
                    let warning = format!(
                        "settings parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    /// Save atomically (temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{SETTINGS_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        if std::fs::rename(&tmp, path).is_err() {
            let result = std::fs::write(path, &contents);
            let _ = std::fs::remove_file(&tmp);
            return result;
        }
        Ok(())
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Check every field, collecting all problems.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
        ] {
            if value < -1 {
                errors.push(ValidationError::InvalidTimeout { field, value });
            }
        }
        if !(10..=60_000).contains(&self.poll_interval_ms) {
            errors.push(ValidationError::InvalidPollInterval(self.poll_interval_ms));
        }
        let dir = self.sync_dir.trim();
        if !dir.is_empty() && !Path::new(dir).is_absolute() {
            errors.push(ValidationError::RelativeSyncDir(dir.to_string()));
        }
        for (field, value) in [
            ("timeout_if_interruptible", self.open.timeout_if_interruptible),
            ("timeout_if_transient", self.open.timeout_if_transient),
        ] {
            if value > MAX_OPEN_TIMEOUT_MS {
                errors.push(ValidationError::OpenTimeoutTooLarge { field, value });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    pub fn read_timeout(&self) -> Timeout {
        Timeout::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Timeout {
        Timeout::from_millis(self.write_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The configured named-primitive directory, if any.
    pub fn sync_dir(&self) -> Option<PathBuf> {
        let dir = self.sync_dir.trim();
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Priority ──

    #[test]
    fn priority_order() {
        assert!(Priority::Idle < Priority::VeryLow);
        assert!(Priority::High < Priority::VeryHigh);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn priority_below_and_above() {
        let below: Vec<_> = Priority::Low.below().collect();
        assert_eq!(below, vec![Priority::Idle, Priority::VeryLow]);
        assert_eq!(Priority::VeryHigh.above().count(), 0);
    }

    #[test]
    fn priority_parse() {
        assert_eq!("very_high".parse::<Priority>().unwrap(), Priority::VeryHigh);
        assert_eq!(" Low ".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    // ── OpenConfiguration ──

    #[test]
    fn open_defaults() {
        let c = OpenConfiguration::default();
        assert!(!c.exclusive);
        assert!(!c.interruptible);
        assert!(!c.transient);
        assert_eq!(c.priority, Priority::Normal);
        assert_eq!(c.timeout_if_interruptible, 3000);
        assert_eq!(c.timeout_if_transient, 30000);
    }

    #[test]
    fn open_partial_toml_fills_defaults() {
        let c: OpenConfiguration = toml::from_str("exclusive = true\npriority = \"high\"").unwrap();
        assert!(c.exclusive);
        assert_eq!(c.priority, Priority::High);
        assert_eq!(c.timeout_if_transient, 30000);
    }

    #[test]
    fn open_builder() {
        let c = OpenConfiguration::exclusive()
            .with_priority(Priority::Low)
            .with_interruptible(true)
            .with_timeouts(100, 200);
        assert!(c.exclusive && c.interruptible);
        assert_eq!((c.timeout_if_interruptible, c.timeout_if_transient), (100, 200));
    }

    // ── Settings ──

    #[test]
    fn settings_defaults() {
        let s = Settings::default();
        assert_eq!(s.read_timeout(), Timeout::Millis(3000));
        assert_eq!(s.poll_interval(), Duration::from_secs(1));
        assert!(s.sync_dir().is_none());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn negative_timeout_is_infinite() {
        let s: Settings = toml::from_str("read_timeout_ms = -1").unwrap();
        assert_eq!(s.read_timeout(), Timeout::Infinite);
        assert_eq!(s.write_timeout(), Timeout::Millis(3000));
    }

    #[test]
    fn open_table_parsed() {
        let s: Settings = toml::from_str("[open]\nexclusive = true\ntransient = true").unwrap();
        assert!(s.open.exclusive);
        assert!(s.open.transient);
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let s = Settings {
            read_timeout_ms: -5,
            poll_interval_ms: 0,
            sync_dir: "relative/dir".into(),
            open: OpenConfiguration {
                timeout_if_transient: 700_000,
                ..OpenConfiguration::default()
            },
            ..Settings::default()
        };
        let errors = s.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&ValidationError::InvalidPollInterval(0)));
    }

    #[test]
    fn validation_error_display() {
        let e = ValidationError::InvalidTimeout {
            field: "read_timeout_ms",
            value: -3,
        };
        assert!(e.to_string().contains("read_timeout_ms"));
    }

    #[test]
    fn settings_path_ends_with_toml() {
        if let Some(p) = Settings::path() {
            assert!(p.ends_with("hidport/config.toml"));
        }
    }

    // ── save_to / load_from ──

    #[test]
    fn save_to_load_from_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let s = Settings {
            read_timeout_ms: -1,
            poll_interval_ms: 250,
            sync_dir: "/var/tmp/hp".into(),
            open: OpenConfiguration::exclusive().with_priority(Priority::VeryHigh),
            ..Settings::default()
        };
        s.save_to(&path).unwrap();
        let (loaded, warnings) = Settings::load_from(&path);
        assert!(warnings.is_empty());
        assert_eq!(loaded, s);
    }

    #[test]
    fn save_to_includes_header_and_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Settings::default().save_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# hidport settings"));
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (s, warnings) = Settings::load_from(&dir.path().join("nope.toml"));
        assert_eq!(s, Settings::default());
        assert!(warnings.is_empty());
    }

    #[test]
    fn load_from_invalid_toml_returns_defaults_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"fast\"").unwrap();
        let (s, warnings) = Settings::load_from(&path);
        assert_eq!(s, Settings::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("using defaults"));
    }
}
