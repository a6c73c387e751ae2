use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NatError {
    #[error("NAT entry for {0} already exists")]
    AlreadyExists(Ipv4Addr),
    #[error("no NAT entry for {0}")]
    NotFound(Ipv4Addr),
}

/// Process-wide destination rewrite table.
///
/// Rewrites are strictly address-for-address; ports are never touched.
/// Written at startup and through the control surface, read on every
/// outbound dial. One lock, held for the duration of a single lookup.
pub struct NatTable {
    entries: Mutex<HashMap<Ipv4Addr, Ipv4Addr>>,
}

impl NatTable {
    pub fn new(initial: HashMap<Ipv4Addr, Ipv4Addr>) -> Self {
        Self {
            entries: Mutex::new(initial),
        }
    }

    /// Rewrite `ip` if a mapping exists, otherwise hand it back unchanged.
    pub fn translate(&self, ip: Ipv4Addr) -> Ipv4Addr {
        let entries = self.entries.lock().unwrap();
        entries.get(&ip).copied().unwrap_or(ip)
    }

    pub fn insert(&self, from: Ipv4Addr, to: Ipv4Addr) -> Result<(), NatError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&from) {
            return Err(NatError::AlreadyExists(from));
        }
        entries.insert(from, to);
        Ok(())
    }

    pub fn remove(&self, from: Ipv4Addr) -> Result<Ipv4Addr, NatError> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&from).ok_or(NatError::NotFound(from))
    }

    pub fn snapshot(&self) -> HashMap<Ipv4Addr, Ipv4Addr> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// 169.254.0.0/16. Traffic for these destinations stays on the link and is
/// never forwarded to the host.
pub fn is_link_local(ip: Ipv4Addr) -> bool {
    ip.octets()[0] == 169 && ip.octets()[1] == 254
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_hits_and_misses() {
        let host_virtual = Ipv4Addr::new(192, 168, 127, 254);
        let nat = NatTable::new(HashMap::from([(host_virtual, Ipv4Addr::LOCALHOST)]));

        assert_eq!(nat.translate(host_virtual), Ipv4Addr::LOCALHOST);
        let other = Ipv4Addr::new(8, 8, 8, 8);
        assert_eq!(nat.translate(other), other);
    }

    #[test]
    fn test_insert_conflict_and_remove() {
        let nat = NatTable::new(HashMap::new());
        let from = Ipv4Addr::new(192, 168, 127, 253);
        let to = Ipv4Addr::new(127, 0, 0, 2);

        nat.insert(from, to).unwrap();
        assert_eq!(nat.insert(from, to), Err(NatError::AlreadyExists(from)));
        assert_eq!(nat.remove(from), Ok(to));
        assert_eq!(nat.remove(from), Err(NatError::NotFound(from)));
        assert!(nat.is_empty());
    }

    #[test]
    fn test_insert_then_remove_restores_state() {
        let nat = NatTable::new(HashMap::new());
        let before = nat.snapshot();
        let from = Ipv4Addr::new(192, 168, 127, 200);
        nat.insert(from, Ipv4Addr::LOCALHOST).unwrap();
        nat.remove(from).unwrap();
        assert_eq!(nat.snapshot(), before);
    }

    #[test]
    fn test_link_local() {
        assert!(is_link_local(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!is_link_local(Ipv4Addr::new(169, 253, 1, 1)));
        assert!(!is_link_local(Ipv4Addr::new(192, 168, 127, 1)));
    }
}
