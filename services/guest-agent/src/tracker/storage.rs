//! Mutex-guarded container-id to port-map storage.
//!
//! Owned exclusively by one tracker instance; every mutation goes through
//! that tracker's methods. Add replaces the stored entry wholesale.

use std::collections::HashMap;
use std::sync::Mutex;

use portbridge_portmap::PortMap;

#[derive(Default)]
pub(crate) struct PortStorage {
    entries: Mutex<HashMap<String, PortMap>>,
}

impl PortStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, container_id: &str, ports: PortMap) {
        self.entries
            .lock()
            .expect("port storage lock poisoned")
            .insert(container_id.to_string(), ports);
    }

    pub(crate) fn get(&self, container_id: &str) -> PortMap {
        self.entries
            .lock()
            .expect("port storage lock poisoned")
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn remove(&self, container_id: &str) {
        self.entries
            .lock()
            .expect("port storage lock poisoned")
            .remove(container_id);
    }

    pub(crate) fn get_all(&self) -> HashMap<String, PortMap> {
        self.entries
            .lock()
            .expect("port storage lock poisoned")
            .clone()
    }

    pub(crate) fn remove_all(&self) {
        self.entries
            .lock()
            .expect("port storage lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portbridge_portmap::{PortBinding, PortKey};

    fn sample_map(port: u16) -> PortMap {
        let mut map = PortMap::new();
        map.insert(
            PortKey::tcp(port),
            vec![PortBinding::new("0.0.0.0", port.to_string())],
        );
        map
    }

    #[test]
    fn test_add_replaces_wholesale() {
        let storage = PortStorage::new();
        storage.add("c1", sample_map(80));
        storage.add("c1", sample_map(443));

        let stored = storage.get("c1");
        assert_eq!(stored.len(), 1);
        assert!(stored.contains_key(&PortKey::tcp(443)));
    }

    #[test]
    fn test_get_untracked_is_empty() {
        let storage = PortStorage::new();
        assert!(storage.get("missing").is_empty());
    }

    #[test]
    fn test_remove_all_clears_everything() {
        let storage = PortStorage::new();
        storage.add("c1", sample_map(80));
        storage.add("c2", sample_map(81));

        storage.remove_all();
        assert!(storage.get("c1").is_empty());
        assert!(storage.get("c2").is_empty());
        assert!(storage.get_all().is_empty());
    }
}
