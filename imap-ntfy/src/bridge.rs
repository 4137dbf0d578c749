//! The poll cycle: compare the unread messages of every monitored folder against the seen
//! store, notify the new ones and record them.

use crate::backend::{Backend, ObservedMessage, Session};
use crate::config::Config;
use crate::notify::{truncate, Notifier, Template};
use crate::scheduler::Shutdown;
use crate::store::SeenStore;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Level};

/// Maximum subject length written to the log.
const LOG_SUBJECT_LENGTH: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to open mailbox session: {0}")]
    Connect(#[source] crate::backend::Error),
    #[error("Failed to list unread messages: {0}")]
    Fetch(#[source] crate::backend::Error),
    #[error("Seen store: {0}")]
    Store(#[from] crate::store::Error),
    #[error("Failed to record notified message {message_id}: {source}")]
    Record {
        message_id: String,
        /// Notifications delivered in the folder before the cycle was aborted.
        notified: usize,
        #[source]
        source: crate::store::Error,
    },
}

impl Error {
    /// Number of notifications that were delivered before the folder failed.
    #[must_use]
    pub fn notified(&self) -> usize {
        match self {
            Error::Record { notified, .. } => *notified,
            _ => 0,
        }
    }
}

/// Decides which folders record their current backlog silently on the first cycle.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum BootstrapPolicy {
    /// Every folder is bootstrapped after each process start.
    #[default]
    Always,
    /// Only folders without any seen record are bootstrapped.
    EmptyStore,
    /// No folder is bootstrapped, every unread message missing from the store is notified.
    Never,
}

impl FromStr for BootstrapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "empty-store" | "empty_store" => Ok(Self::EmptyStore),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "'{s}' is not a bootstrap policy, expected always/empty-store/never"
            )),
        }
    }
}

/// Processing mode of a folder.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FolderMode {
    /// Unread messages are recorded without notification.
    Bootstrap,
    /// Unread messages missing from the store are notified, then recorded.
    Normal,
}

/// Counters of a successfully processed folder.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FolderReport {
    /// Unread messages returned by the server.
    pub observed: usize,
    /// Notifications accepted by the notifier.
    pub notified: usize,
    /// Seen records written.
    pub recorded: usize,
    /// Messages skipped because they were already recorded.
    pub already_seen: usize,
    /// Notifications which failed and will be retried next cycle.
    pub failed: usize,
    /// Processing stopped early because shutdown was requested.
    pub interrupted: bool,
}

/// Output of polling a single folder.
#[derive(Debug)]
pub struct FolderOutput {
    pub folder: String,
    /// Mode the folder was processed in.
    pub mode: FolderMode,
    pub result: Result<FolderReport, Error>,
}

/// Settings of the poll cycle.
#[derive(Debug, Clone)]
pub struct Options {
    /// Folders in processing order.
    pub folders: Vec<String>,
    pub template: Template,
    pub bootstrap: BootstrapPolicy,
}

impl From<&Config> for Options {
    fn from(config: &Config) -> Self {
        Self {
            folders: config.folders.clone(),
            template: config.template.clone(),
            bootstrap: config.bootstrap,
        }
    }
}

struct FolderState {
    name: String,
    mode: FolderMode,
}

/// Connects the mailbox with the notifier and the seen store.
pub struct Bridge {
    backend: Arc<dyn Backend>,
    store: Arc<dyn SeenStore>,
    notifier: Arc<dyn Notifier>,
    template: Template,
    folders: Vec<FolderState>,
}

impl Bridge {
    /// Create a new instance. The initial mode of every folder is derived from the bootstrap
    /// policy in `options`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        store: Arc<dyn SeenStore>,
        notifier: Arc<dyn Notifier>,
        options: Options,
    ) -> Self {
        let folders = options
            .folders
            .into_iter()
            .map(|name| {
                let mode = initial_mode(store.as_ref(), &name, options.bootstrap);
                debug!("Folder {name} starts in {mode:?} mode");
                FolderState { name, mode }
            })
            .collect();

        Self {
            backend,
            store,
            notifier,
            template: options.template,
            folders,
        }
    }

    /// Current mode of `folder`, `None` if the folder is not monitored.
    #[must_use]
    pub fn mode(&self, folder: &str) -> Option<FolderMode> {
        self.folders
            .iter()
            .find(|f| f.name == folder)
            .map(|f| f.mode)
    }

    /// Whether at least one folder still has to complete its bootstrap pass.
    #[must_use]
    pub fn is_bootstrapping(&self) -> bool {
        self.folders.iter().any(|f| f.mode == FolderMode::Bootstrap)
    }

    /// Run one poll cycle over all folders.
    ///
    /// Failures are contained per folder and returned in the matching [`FolderOutput`]. Folders
    /// after a requested `shutdown` are not visited.
    #[tracing::instrument(level=Level::DEBUG, skip(self, shutdown))]
    pub fn poll(&mut self, shutdown: &Shutdown) -> Vec<FolderOutput> {
        let mut session: Option<Box<dyn Session>> = None;
        let mut outputs = Vec::with_capacity(self.folders.len());

        for index in 0..self.folders.len() {
            if shutdown.is_requested() {
                debug!("Shutdown requested, skipping remaining folders");
                break;
            }

            let folder = self.folders[index].name.clone();
            let mode = self.folders[index].mode;
            let result = info_span!("folder", folder = %folder)
                .in_scope(|| self.poll_folder(&mut session, &folder, mode, shutdown));

            match &result {
                Ok(report) => {
                    if mode == FolderMode::Bootstrap && !report.interrupted {
                        info!(
                            "Bootstrap of {folder} complete, {} existing messages recorded",
                            report.recorded
                        );
                        self.folders[index].mode = FolderMode::Normal;
                    }
                }
                Err(e) => {
                    error!("Failed to process folder {folder}: {e}");
                    session = None;
                }
            }

            outputs.push(FolderOutput {
                folder,
                mode,
                result,
            });
        }

        if let Some(mut session) = session {
            if let Err(e) = session.logout() {
                warn!("Failed to logout: {e}");
            }
        }

        outputs
    }

    fn poll_folder(
        &self,
        session: &mut Option<Box<dyn Session>>,
        folder: &str,
        mode: FolderMode,
        shutdown: &Shutdown,
    ) -> Result<FolderReport, Error> {
        let mut active = match session.take() {
            Some(active) => active,
            None => self.backend.open().map_err(Error::Connect)?,
        };
        let messages = active.unseen(folder).map_err(Error::Fetch)?;
        *session = Some(active);

        debug!("{} unread messages in {mode:?} mode", messages.len());
        match mode {
            FolderMode::Bootstrap => self.bootstrap(folder, &messages, shutdown),
            FolderMode::Normal => self.notify_new(folder, &messages, shutdown),
        }
    }

    fn bootstrap(
        &self,
        folder: &str,
        messages: &[ObservedMessage],
        shutdown: &Shutdown,
    ) -> Result<FolderReport, Error> {
        let mut report = FolderReport {
            observed: messages.len(),
            ..FolderReport::default()
        };

        for message in messages {
            if shutdown.is_requested() {
                report.interrupted = true;
                break;
            }
            self.store.insert(folder, &message.id)?;
            report.recorded += 1;
        }

        Ok(report)
    }

    fn notify_new(
        &self,
        folder: &str,
        messages: &[ObservedMessage],
        shutdown: &Shutdown,
    ) -> Result<FolderReport, Error> {
        let mut report = FolderReport {
            observed: messages.len(),
            ..FolderReport::default()
        };

        for message in messages {
            if shutdown.is_requested() {
                report.interrupted = true;
                break;
            }

            if self.store.contains(folder, &message.id)? {
                report.already_seen += 1;
                continue;
            }

            let subject = truncate(&message.subject, LOG_SUBJECT_LENGTH);
            let notification = self.template.render(message);
            if let Err(e) = self.notifier.send(&notification) {
                error!("Failed to send notification for '{subject}': {e}");
                report.failed += 1;
                continue;
            }
            report.notified += 1;
            info!("Notification sent for '{subject}'");

            self.store
                .insert(folder, &message.id)
                .map_err(|source| {
                    error!(
                        "Notified message {} could not be recorded and will be notified again: {source}",
                        message.id
                    );
                    Error::Record {
                        message_id: message.id.clone(),
                        notified: report.notified,
                        source,
                    }
                })?;
            report.recorded += 1;
        }

        Ok(report)
    }
}

fn initial_mode(store: &dyn SeenStore, folder: &str, policy: BootstrapPolicy) -> FolderMode {
    match policy {
        BootstrapPolicy::Always => FolderMode::Bootstrap,
        BootstrapPolicy::Never => FolderMode::Normal,
        BootstrapPolicy::EmptyStore => match store.count(folder) {
            Ok(0) => FolderMode::Bootstrap,
            Ok(_) => FolderMode::Normal,
            Err(e) => {
                warn!("Failed to count records of {folder}, bootstrapping it: {e}");
                FolderMode::Bootstrap
            }
        },
    }
}
