use imap_ntfy::backend::{Backend, Error as BackendError, ObservedMessage, Result, Session};
use imap_ntfy::bridge::{BootstrapPolicy, Bridge, FolderOutput, FolderReport, Options};
use imap_ntfy::notify::{Error as NotifyError, Notification, Notifier, Priority, Template};
use imap_ntfy::scheduler::Shutdown;
use imap_ntfy::store::memory::MemoryStore;
use imap_ntfy::store::{Error as StoreError, SeenStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use temp_dir::TempDir;

pub fn message(id: &str, subject: &str) -> ObservedMessage {
    ObservedMessage {
        id: id.to_owned(),
        subject: subject.to_owned(),
        sender: None,
    }
}

#[derive(Default)]
struct Mailbox {
    folders: HashMap<String, Vec<ObservedMessage>>,
    broken: HashSet<String>,
    offline: bool,
    opened: usize,
}

/// Scriptable in-memory mailbox.
#[derive(Clone, Default)]
pub struct FakeBackend(Arc<Mutex<Mailbox>>);

impl FakeBackend {
    /// Replace the unread messages of `folder`.
    pub fn set_unseen(&self, folder: &str, messages: Vec<ObservedMessage>) {
        self.0.lock().folders.insert(folder.to_owned(), messages);
    }

    /// Add an unread message to `folder`.
    pub fn deliver(&self, folder: &str, message: ObservedMessage) {
        self.0
            .lock()
            .folders
            .entry(folder.to_owned())
            .or_default()
            .push(message);
    }

    /// Make listing `folder` fail.
    pub fn set_broken(&self, folder: &str, broken: bool) {
        let mut guard = self.0.lock();
        if broken {
            guard.broken.insert(folder.to_owned());
        } else {
            guard.broken.remove(folder);
        }
    }

    /// Make opening sessions fail.
    pub fn set_offline(&self, offline: bool) {
        self.0.lock().offline = offline;
    }

    /// Number of sessions opened so far.
    pub fn opened(&self) -> usize {
        self.0.lock().opened
    }
}

impl Backend for FakeBackend {
    fn open(&self) -> Result<Box<dyn Session>> {
        let mut guard = self.0.lock();
        if guard.offline {
            return Err(BackendError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "offline",
            )));
        }
        guard.opened += 1;
        Ok(Box::new(FakeSession(Arc::clone(&self.0))))
    }
}

struct FakeSession(Arc<Mutex<Mailbox>>);

impl Session for FakeSession {
    fn unseen(&mut self, folder: &str) -> Result<Vec<ObservedMessage>> {
        let guard = self.0.lock();
        if guard.broken.contains(folder) {
            return Err(BackendError::Other(anyhow::anyhow!(
                "folder {folder} unavailable"
            )));
        }
        Ok(guard.folders.get(folder).cloned().unwrap_or_default())
    }

    fn logout(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Outbox {
    sent: Vec<Notification>,
    failing: bool,
    attempts: usize,
}

/// Notifier which keeps every delivered notification.
#[derive(Clone, Default)]
pub struct RecordingNotifier(Arc<Mutex<Outbox>>);

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.0.lock().sent.clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.0.lock().sent.iter().map(|n| n.body.clone()).collect()
    }

    pub fn attempts(&self) -> usize {
        self.0.lock().attempts
    }

    pub fn set_failing(&self, failing: bool) {
        self.0.lock().failing = failing;
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, notification: &Notification) -> imap_ntfy::notify::Result<()> {
        let mut guard = self.0.lock();
        guard.attempts += 1;
        if guard.failing {
            return Err(NotifyError::Other(anyhow::anyhow!("ntfy unavailable")));
        }
        guard.sent.push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct Faults {
    contains: HashSet<String>,
    insert: bool,
}

/// In-memory store whose reads and writes can be made to fail.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    faults: Arc<Mutex<Faults>>,
}

impl FlakyStore {
    /// Make lookups in `folder` fail.
    pub fn set_contains_failing(&self, folder: &str, failing: bool) {
        let mut guard = self.faults.lock();
        if failing {
            guard.contains.insert(folder.to_owned());
        } else {
            guard.contains.remove(folder);
        }
    }

    /// Make every insert fail.
    pub fn set_insert_failing(&self, failing: bool) {
        self.faults.lock().insert = failing;
    }
}

fn unavailable() -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "database gone",
    ))
}

impl SeenStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    fn contains(&self, folder: &str, message_id: &str) -> imap_ntfy::store::Result<bool> {
        if self.faults.lock().contains.contains(folder) {
            return Err(unavailable());
        }
        self.inner.contains(folder, message_id)
    }

    fn insert(&self, folder: &str, message_id: &str) -> imap_ntfy::store::Result<()> {
        if self.faults.lock().insert {
            return Err(unavailable());
        }
        self.inner.insert(folder, message_id)
    }

    fn count(&self, folder: &str) -> imap_ntfy::store::Result<usize> {
        self.inner.count(folder)
    }
}

pub fn names(folders: &[&str]) -> Vec<String> {
    folders.iter().map(|f| (*f).to_owned()).collect()
}

pub fn template() -> Template {
    Template {
        title: Some("New Mail".to_owned()),
        icon: Some("https://example.com/mail.png".to_owned()),
        priority: Priority::High,
        ..Template::default()
    }
}

/// Test context to keep track of resources.
pub struct TestCtx {
    pub bridge: Bridge,
    pub backend: FakeBackend,
    pub notifier: RecordingNotifier,
    pub store: Arc<dyn SeenStore>,
    pub shutdown: Shutdown,
    _temp_dir: Option<TempDir>,
}

impl TestCtx {
    /// Create a new instance backed by an in-memory store.
    pub fn new(folders: &[&str], bootstrap: BootstrapPolicy) -> Self {
        let store = imap_ntfy::store::open("memory://", &[]).unwrap();
        Self::with_store(folders, bootstrap, store, None)
    }

    /// Create a new instance backed by a sqlite file in a temporary directory.
    pub fn with_sqlite(folders: &[&str], bootstrap: BootstrapPolicy) -> Self {
        let dir = TempDir::with_prefix("imap_ntfy_test").unwrap();
        let url = format!("sqlite:///{}", dir.path().join("messages.db").display());
        let store = imap_ntfy::store::open(&url, &names(folders)).unwrap();
        Self::with_store(folders, bootstrap, store, Some(dir))
    }

    /// Create a new instance with `store`, seeding the fake mailbox before the bridge is built.
    pub fn with_store(
        folders: &[&str],
        bootstrap: BootstrapPolicy,
        store: Arc<dyn SeenStore>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let backend = FakeBackend::default();
        let notifier = RecordingNotifier::default();
        let bridge = Bridge::new(
            Arc::new(backend.clone()),
            Arc::clone(&store),
            Arc::new(notifier.clone()),
            Options {
                folders: names(folders),
                template: template(),
                bootstrap,
            },
        );

        Self {
            bridge,
            backend,
            notifier,
            store,
            shutdown: Shutdown::new(),
            _temp_dir: temp_dir,
        }
    }

    /// Run one cycle.
    pub fn poll(&mut self) -> Vec<FolderOutput> {
        self.bridge.poll(&self.shutdown)
    }

    /// Run one cycle and return the report of `folder`, panicking if it failed.
    pub fn poll_ok(&mut self, folder: &str) -> FolderReport {
        let outputs = self.poll();
        let output = outputs
            .iter()
            .find(|o| o.folder == folder)
            .unwrap_or_else(|| panic!("no output for {folder}"));
        match &output.result {
            Ok(report) => *report,
            Err(e) => panic!("folder {folder} failed: {e}"),
        }
    }

    pub fn seen(&self, folder: &str, id: &str) -> bool {
        self.store.contains(folder, id).unwrap()
    }
}
