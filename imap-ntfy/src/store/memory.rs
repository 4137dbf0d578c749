use crate::store::{Result, SeenStore};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Process local store, records are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    seen: Mutex<HashSet<(String, String)>>,
}

impl SeenStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn contains(&self, folder: &str, message_id: &str) -> Result<bool> {
        Ok(self
            .seen
            .lock()
            .contains(&(folder.to_owned(), message_id.to_owned())))
    }

    fn insert(&self, folder: &str, message_id: &str) -> Result<()> {
        self.seen
            .lock()
            .insert((folder.to_owned(), message_id.to_owned()));
        Ok(())
    }

    fn count(&self, folder: &str) -> Result<usize> {
        Ok(self
            .seen
            .lock()
            .iter()
            .filter(|(f, _)| f == folder)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_scoped_by_folder() {
        let store = MemoryStore::default();
        store.insert("INBOX", "a").unwrap();
        store.insert("INBOX", "a").unwrap();
        store.insert("Work", "b").unwrap();

        assert!(store.contains("INBOX", "a").unwrap());
        assert!(!store.contains("Work", "a").unwrap());
        assert_eq!(store.count("INBOX").unwrap(), 1);
        assert_eq!(store.count("Work").unwrap(), 1);
        assert_eq!(store.count("Spam").unwrap(), 0);
    }
}
