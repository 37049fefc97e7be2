//! Configuration for the seeker bot
//!
//! Settings load from a TOML file, with environment-variable overrides for
//! credentials so secrets stay out of the config file.

use std::path::Path;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeekerError};
use crate::filter::PreferenceWindow;
use crate::slot::{PageRef, TargetDescriptor};

/// Lowest poll interval the bot will accept, to respect the remote
/// system's implicit rate limits.
pub const POLL_INTERVAL_FLOOR_SECS: u64 = 30;

/// Top-level settings, immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub moodle: MoodleConfig,
    pub telegram: TelegramConfig,
    pub seeker: SeekerSection,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// How long to wait for the operator's reply before releasing the hold.
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}

fn default_reply_timeout_secs() -> u64 {
    3600
}

/// Booking-site connection and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodleConfig {
    #[serde(default = "default_moodle_url")]
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_moodle_url() -> String {
    "https://moodle.czu.cz".to_string()
}

/// Telegram bot transport used to reach the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

/// The monitored seeker page and the operator's date/time preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeekerSection {
    /// URL of the seeker booking page.
    pub page_url: String,
    /// Name of the test section to watch on that page.
    pub test_name: String,
    pub date_range: DateRange,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// A named transfer destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub page_url: String,
}

/// Poll cadence. The interval is floored at [`POLL_INTERVAL_FLOOR_SECS`]
/// and jittered by up to `jitter_secs` either way per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub jitter_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            jitter_secs: 5,
        }
    }
}

/// Retry configuration for transient remote failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,
    /// Initial retry delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on a single retry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f32,
    /// Add randomness to retry delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Per-hold transfer budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// How many transfer attempts (unavailable target, transient failure,
    /// unparseable reply) are allowed before the hold is given up.
    pub max_attempts: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Bounds on the seen-slot memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub max_entries: usize,
    pub max_age_hours: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 512,
            max_age_hours: 24,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file and apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut settings: Settings = toml::from_str(&contents)
            .map_err(|e| SeekerError::config(format!("invalid config file: {e}")))?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Environment variables override file-provided credentials.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MOODLE_USERNAME") {
            self.moodle.username = v;
        }
        if let Ok(v) = std::env::var("MOODLE_PASSWORD") {
            self.moodle.password = v;
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.moodle.username.is_empty() || self.moodle.password.is_empty() {
            return Err(SeekerError::config("missing Moodle credentials"));
        }
        if self.telegram.bot_token.is_empty() || self.telegram.chat_id.is_empty() {
            return Err(SeekerError::config("missing Telegram credentials"));
        }
        if self.targets.is_empty() {
            return Err(SeekerError::config("at least one transfer target required"));
        }
        if self.seeker.date_range.start > self.seeker.date_range.end {
            return Err(SeekerError::config("seeker date range is reversed"));
        }
        if self.seeker.time_range.start > self.seeker.time_range.end {
            return Err(SeekerError::config("seeker time range is reversed"));
        }
        Ok(())
    }

    /// Reference to the seeker page, narrowed to the watched test section.
    pub fn seeker_page(&self) -> PageRef {
        PageRef::with_section(&self.seeker.page_url, &self.seeker.test_name)
    }

    /// Configured transfer destinations as descriptors.
    pub fn target_descriptors(&self) -> Vec<TargetDescriptor> {
        self.targets
            .iter()
            .map(|t| TargetDescriptor {
                name: t.name.clone(),
                page: PageRef::new(&t.page_url),
            })
            .collect()
    }

    /// The operator's date/time preference window.
    pub fn window(&self) -> PreferenceWindow {
        PreferenceWindow {
            first_date: self.seeker.date_range.start,
            last_date: self.seeker.date_range.end,
            earliest: self.seeker.time_range.start,
            latest: self.seeker.time_range.end,
        }
    }

    /// Effective poll interval with the rate-limit floor applied.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_secs.max(POLL_INTERVAL_FLOOR_SECS))
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_secs(self.poll.jitter_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// Builder used by tests and embedders to assemble settings in code.
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings {
                moodle: MoodleConfig {
                    base_url: default_moodle_url(),
                    username: String::new(),
                    password: String::new(),
                },
                telegram: TelegramConfig {
                    bot_token: String::new(),
                    chat_id: String::new(),
                },
                seeker: SeekerSection {
                    page_url: String::new(),
                    test_name: String::new(),
                    date_range: DateRange {
                        start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                        end: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
                    },
                    time_range: TimeRange {
                        start: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                        end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                    },
                },
                targets: vec![],
                poll: PollConfig::default(),
                retry: RetryConfig::default(),
                transfer: TransferConfig::default(),
                memory: MemoryConfig::default(),
                reply_timeout_secs: default_reply_timeout_secs(),
            },
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.settings.moodle.username = username.into();
        self.settings.moodle.password = password.into();
        self
    }

    pub fn telegram(mut self, token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        self.settings.telegram.bot_token = token.into();
        self.settings.telegram.chat_id = chat_id.into();
        self
    }

    pub fn seeker(mut self, page_url: impl Into<String>, test_name: impl Into<String>) -> Self {
        self.settings.seeker.page_url = page_url.into();
        self.settings.seeker.test_name = test_name.into();
        self
    }

    pub fn date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.settings.seeker.date_range = DateRange { start, end };
        self
    }

    pub fn time_range(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.settings.seeker.time_range = TimeRange { start, end };
        self
    }

    pub fn target(mut self, name: impl Into<String>, page_url: impl Into<String>) -> Self {
        self.settings.targets.push(TargetConfig {
            name: name.into(),
            page_url: page_url.into(),
        });
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.settings.reply_timeout_secs = timeout.as_secs();
        self
    }

    pub fn max_transfer_attempts(mut self, attempts: u32) -> Self {
        self.settings.transfer.max_attempts = attempts;
        self
    }

    pub fn build(self) -> Settings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> SettingsBuilder {
        SettingsBuilder::new()
            .credentials("user", "pass")
            .telegram("token", "chat")
            .seeker("https://moodle.example/mod/tcb/view.php?id=1", "UNIX exam")
            .target("UNIX centre A", "https://moodle.example/mod/tcb/view.php?id=2")
    }

    #[test]
    fn defaults_are_sane() {
        let settings = minimal().build();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.transfer.max_attempts, 3);
        assert_eq!(settings.reply_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn poll_interval_has_floor() {
        let mut settings = minimal().build();
        settings.poll.interval_secs = 5;
        assert_eq!(settings.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn validation_rejects_missing_targets() {
        let mut settings = minimal().build();
        settings.targets.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validation_rejects_reversed_ranges() {
        let mut settings = minimal().build();
        settings.seeker.date_range.start = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        settings.seeker.date_range.end = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
            [moodle]
            username = "u"
            password = "p"

            [telegram]
            bot_token = "t"
            chat_id = "c"

            [seeker]
            page_url = "https://moodle.example/mod/tcb/view.php?id=1"
            test_name = "UNIX exam"
            date_range = { start = "2026-01-15", end = "2026-01-25" }
            time_range = { start = "10:00:00", end = "16:00:00" }

            [[targets]]
            name = "Centre A"
            page_url = "https://moodle.example/mod/tcb/view.php?id=2"

            [poll]
            interval_secs = 45
            jitter_secs = 3
        "#;
        let settings: Settings = toml::from_str(toml).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.poll.interval_secs, 45);
        let window = settings.window();
        assert_eq!(
            window.first_date,
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
        );
    }
}
