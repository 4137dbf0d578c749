//! Service configuration, read once from the environment at startup.

use crate::bridge::BootstrapPolicy;
use crate::notify::{Priority, Template};
use http::url::Url;
use secrecy::SecretString;
use std::time::Duration;
use thiserror::Error;

pub const IMAP_HOST: &str = "IMAP_HOST";
pub const IMAP_PORT: &str = "IMAP_PORT";
pub const IMAP_USER: &str = "IMAP_USER";
pub const IMAP_PASS: &str = "IMAP_PASS";
pub const IMAP_SSL: &str = "IMAP_SSL";
pub const IMAP_FOLDERS: &str = "IMAP_FOLDERS";
pub const IMAP_TIMEOUT: &str = "IMAP_TIMEOUT";
pub const BATCH_SIZE: &str = "BATCH_SIZE";
pub const NTFY_TOPIC: &str = "NTFY_TOPIC";
pub const NTFY_TITLE: &str = "NTFY_TITLE";
pub const NTFY_ICON: &str = "NTFY_ICON";
pub const NTFY_PRIORITY: &str = "NTFY_PRIORITY";
pub const NTFY_TAGS: &str = "NTFY_TAGS";
pub const NTFY_TOKEN: &str = "NTFY_TOKEN";
pub const NTFY_TIMEOUT: &str = "NTFY_TIMEOUT";
pub const NTFY_INCLUDE_SENDER: &str = "NTFY_INCLUDE_SENDER";
pub const NTFY_MAX_BODY_LENGTH: &str = "NTFY_MAX_BODY_LENGTH";
pub const CHECK_INTERVAL: &str = "CHECK_INTERVAL";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const BOOTSTRAP: &str = "BOOTSTRAP";
pub const LOG_LEVEL: &str = "LOG_LEVEL";

const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_FOLDER: &str = "INBOX";
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_IMAP_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 300;
const DEFAULT_NTFY_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///messages.db";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Connection settings for the mail server.
#[derive(Debug)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Implicit TLS when true, plain TCP otherwise.
    pub tls: bool,
    /// Maximum number of messages requested per header fetch.
    pub batch_size: usize,
    /// Connect, read and write timeout of the server connection.
    pub timeout: Duration,
}

/// Where and how notifications are delivered.
#[derive(Debug)]
pub struct NtfyConfig {
    pub topic: Url,
    pub token: Option<SecretString>,
    pub timeout: Duration,
}

/// Complete service configuration.
///
/// Constructed once and shared by reference, nothing mutates it after startup.
#[derive(Debug)]
pub struct Config {
    pub imap: ImapConfig,
    pub folders: Vec<String>,
    pub ntfy: NtfyConfig,
    pub template: Template,
    pub check_interval: Duration,
    pub database_url: String,
    pub bootstrap: BootstrapPolicy,
    pub log_filter: String,
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns error if a required variable is missing or a value can not be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary `lookup` function. Empty values are treated
    /// as unset.
    ///
    /// All missing required keys are reported in a single error.
    ///
    /// # Errors
    ///
    /// Returns error if a required variable is missing or a value can not be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        let host = get(IMAP_HOST);
        let username = get(IMAP_USER);
        // Passwords may legitimately carry surrounding whitespace.
        let password = lookup(IMAP_PASS).filter(|v| !v.is_empty());
        let topic = get(NTFY_TOPIC);

        let missing = [
            (IMAP_HOST, host.is_none()),
            (IMAP_USER, username.is_none()),
            (IMAP_PASS, password.is_none()),
            (NTFY_TOPIC, topic.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, missing)| missing.then_some(key))
        .collect::<Vec<_>>();

        let (Some(host), Some(username), Some(password), Some(topic)) =
            (host, username, password, topic)
        else {
            return Err(Error::Missing(missing));
        };

        let port = match get(IMAP_PORT) {
            None => DEFAULT_IMAP_PORT,
            Some(v) => v
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| invalid(IMAP_PORT, format!("'{v}' is not a valid port")))?,
        };

        let tls = get(IMAP_SSL)
            .map(|v| parse_bool(IMAP_SSL, &v))
            .transpose()?
            .unwrap_or(true);

        let folders = parse_folders(get(IMAP_FOLDERS).as_deref().unwrap_or(DEFAULT_FOLDER));
        if folders.is_empty() {
            return Err(invalid(IMAP_FOLDERS, "at least one folder is required"));
        }

        let batch_size = get(BATCH_SIZE)
            .map(|v| parse_positive(BATCH_SIZE, &v))
            .transpose()?
            .map_or(DEFAULT_BATCH_SIZE, |v| usize::try_from(v).unwrap_or(usize::MAX));

        let imap_timeout = get(IMAP_TIMEOUT)
            .map(|v| parse_positive(IMAP_TIMEOUT, &v))
            .transpose()?
            .unwrap_or(DEFAULT_IMAP_TIMEOUT_SECONDS);

        let topic =
            Url::parse(&topic).map_err(|e| invalid(NTFY_TOPIC, format!("'{topic}': {e}")))?;
        if !matches!(topic.scheme(), "http" | "https") {
            return Err(invalid(NTFY_TOPIC, "only http and https urls are supported"));
        }

        let priority = get(NTFY_PRIORITY)
            .map(|v| {
                v.parse::<Priority>()
                    .map_err(|e| invalid(NTFY_PRIORITY, e.to_string()))
            })
            .transpose()?
            .unwrap_or_default();

        let timeout = get(NTFY_TIMEOUT)
            .map(|v| parse_positive(NTFY_TIMEOUT, &v))
            .transpose()?
            .unwrap_or(DEFAULT_NTFY_TIMEOUT_SECONDS);

        let include_sender = get(NTFY_INCLUDE_SENDER)
            .map(|v| parse_bool(NTFY_INCLUDE_SENDER, &v))
            .transpose()?
            .unwrap_or(false);

        let max_body_length = match get(NTFY_MAX_BODY_LENGTH) {
            None => 0,
            Some(v) => v.parse::<usize>().map_err(|_| {
                invalid(
                    NTFY_MAX_BODY_LENGTH,
                    format!("'{v}' is not a non-negative number"),
                )
            })?,
        };

        let check_interval = get(CHECK_INTERVAL)
            .map(|v| parse_positive(CHECK_INTERVAL, &v))
            .transpose()?
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECONDS);

        let bootstrap = get(BOOTSTRAP)
            .map(|v| {
                v.parse::<BootstrapPolicy>()
                    .map_err(|e| invalid(BOOTSTRAP, e))
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            imap: ImapConfig {
                host,
                port,
                username,
                password: SecretString::from(password),
                tls,
                batch_size,
                timeout: Duration::from_secs(imap_timeout),
            },
            folders,
            ntfy: NtfyConfig {
                topic,
                token: get(NTFY_TOKEN).map(SecretString::from),
                timeout: Duration::from_secs(timeout),
            },
            template: Template {
                title: get(NTFY_TITLE),
                icon: get(NTFY_ICON),
                priority,
                tags: get(NTFY_TAGS).map(|v| parse_list(&v)).unwrap_or_default(),
                include_sender,
                max_body_length,
            },
            check_interval: Duration::from_secs(check_interval),
            database_url: get(DATABASE_URL).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned()),
            bootstrap,
            log_filter: get(LOG_LEVEL).unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
        })
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> Error {
    Error::Invalid {
        key,
        reason: reason.into(),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("'{value}' is not a boolean"))),
    }
}

/// Parse a strictly positive whole number. Zero and negative values are rejected here so that
/// misconfigurations surface before the first poll.
fn parse_positive(key: &'static str, value: &str) -> Result<u64> {
    match value.parse::<i64>() {
        Ok(v) if v > 0 => Ok(v.unsigned_abs()),
        Ok(v) => Err(invalid(key, format!("must be greater than zero, got {v}"))),
        Err(_) => Err(invalid(key, format!("'{value}' is not a whole number"))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Split a comma separated folder list, dropping blanks and repeated names.
#[must_use]
pub fn parse_folders(value: &str) -> Vec<String> {
    let mut folders: Vec<String> = Vec::new();
    for folder in parse_list(value) {
        if !folders.contains(&folder) {
            folders.push(folder);
        }
    }
    folders
}
