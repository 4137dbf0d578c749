//! Delivery of new mail notifications.

use crate::backend::ObservedMessage;
#[cfg(test)]
use mockall::automock;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub mod ntfy;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Http: {0}")]
    Http(#[from] http::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transport priority hint, using the ntfy scale of 1 to 5.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Priority {
    Min = 1,
    Low = 2,
    #[default]
    Default = 3,
    High = 4,
    Max = 5,
}

impl Priority {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "min" => Ok(Self::Min),
            "2" | "low" => Ok(Self::Low),
            "3" | "default" => Ok(Self::Default),
            "4" | "high" => Ok(Self::High),
            "5" | "max" | "urgent" => Ok(Self::Max),
            _ => Err(format!(
                "'{s}' is not a priority, expected 1-5 or min/low/default/high/max/urgent"
            )),
        }
    }
}

/// Rendered payload handed to a [`Notifier`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Notification {
    pub title: Option<String>,
    pub body: String,
    pub icon: Option<String>,
    pub priority: Priority,
    pub tags: Vec<String>,
}

/// How an observed message is turned into a [`Notification`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Template {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub priority: Priority,
    pub tags: Vec<String>,
    /// Prefix the body with `<sender>: ` when the sender is known.
    pub include_sender: bool,
    /// Maximum body length in characters, 0 disables truncation.
    pub max_body_length: usize,
}

impl Template {
    /// Build the notification for `message`.
    #[must_use]
    pub fn render(&self, message: &ObservedMessage) -> Notification {
        let body = match (&message.sender, self.include_sender) {
            (Some(sender), true) => format!("{sender}: {}", message.subject),
            _ => message.subject.clone(),
        };

        Notification {
            title: self.title.clone(),
            body: truncate(&body, self.max_body_length),
            icon: self.icon.clone(),
            priority: self.priority,
            tags: self.tags.clone(),
        }
    }
}

/// Cut `value` down to `max` characters, marking the cut with an ellipsis. `max` of 0 keeps the
/// value intact.
#[must_use]
pub fn truncate(value: &str, max: usize) -> String {
    if max == 0 || value.chars().count() <= max {
        return value.to_owned();
    }

    let mut result = value.chars().take(max.saturating_sub(1)).collect::<String>();
    result.push('…');
    result
}

/// Delivers notifications to their destination.
#[cfg_attr(test, automock)]
pub trait Notifier: Send + Sync {
    /// Deliver `notification`. Returning `Ok` means the destination acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns error if the notification was not delivered.
    fn send(&self, notification: &Notification) -> Result<()>;
}
