use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard},
};

/// Local view of who is online. The hub is authoritative; this only follows
/// the ack and the join/leave notices it sends.
#[derive(Debug, Default)]
pub struct UserSet {
    names: Mutex<BTreeSet<String>>,
}

impl UserSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut guard = self.lock();
        guard.clear();
        guard.extend(names);
    }

    /// Returns false when `name` was already present.
    pub fn insert(&self, name: &str) -> bool {
        self.lock().insert(name.to_string())
    }

    /// Returns false when `name` was not present.
    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name)
    }

    pub fn sorted(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove_report_changes() {
        let users = UserSet::new();
        users.seed(vec!["zed".to_string(), "amy".to_string()]);
        assert_eq!(users.sorted(), vec!["amy", "zed"]);

        assert!(users.insert("bob"));
        assert!(!users.insert("bob"));
        assert!(users.remove("zed"));
        assert!(!users.remove("zed"));
        assert_eq!(users.sorted(), vec!["amy", "bob"]);
        assert_eq!(users.len(), 2);
    }

    #[test]
    fn seed_replaces_previous_contents() {
        let users = UserSet::new();
        users.seed(vec!["old".to_string()]);
        users.seed(vec!["new".to_string()]);
        assert_eq!(users.sorted(), vec!["new"]);
        users.seed(Vec::new());
        assert!(users.is_empty());
    }
}
