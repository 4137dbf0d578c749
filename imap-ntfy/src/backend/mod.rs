//! Mail server access. A [`Backend`] opens authenticated [`Session`]s from which the unread
//! messages of a folder can be listed.

#[cfg(test)]
use mockall::automock;

pub mod headers;
pub mod imap;
mod utf7;

/// Expected backend errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("TLS: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("Login failed: {0}")]
    Auth(#[source] ::imap::Error),
    #[error("Imap: {0}")]
    Imap(#[from] ::imap::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An unread message as seen during a single poll.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ObservedMessage {
    /// Identifier which is stable across polls and unique within the folder.
    pub id: String,
    pub subject: String,
    pub sender: Option<String>,
}

/// Factory for mailbox sessions.
#[cfg_attr(test, automock)]
pub trait Backend: Send + Sync {
    /// Connect and authenticate a new session.
    ///
    /// # Errors
    ///
    /// Returns error if the server can not be reached or rejects the login.
    fn open(&self) -> Result<Box<dyn Session>>;
}

/// Authenticated connection to the mailbox.
#[cfg_attr(test, automock)]
pub trait Session: Send {
    /// List every message of `folder` which is currently not marked as read.
    ///
    /// Implementations must not change the read state of the messages.
    ///
    /// # Errors
    ///
    /// Returns error if the folder does not exist or the server request failed.
    fn unseen(&mut self, folder: &str) -> Result<Vec<ObservedMessage>>;

    /// Close the session.
    ///
    /// # Errors
    ///
    /// Returns error if the server request failed.
    fn logout(&mut self) -> Result<()>;
}
