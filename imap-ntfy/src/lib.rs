//! Forward new unread IMAP messages to an ntfy topic.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod db;
pub mod log;
pub mod notify;
pub mod scheduler;
pub mod store;

pub use secrecy;

pub use http;
