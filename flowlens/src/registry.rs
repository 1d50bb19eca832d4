//! Port to server-id mapping, rebuilt from scratch every discovery cycle.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::model::ServerDescriptor;

/// Two descriptors in one discovery result claimed the same port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    pub replaced: String,
    pub kept: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerRegistry {
    ports: HashMap<u16, String>,
}

impl ServerRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a registry from one complete discovery result.
    ///
    /// A port claimed twice goes to the later descriptor. Every such
    /// collision is returned so the caller can report it; the resolution is
    /// order-dependent and not a tie-break anyone should rely on.
    pub fn from_descriptors(descriptors: &[ServerDescriptor]) -> (Self, Vec<PortConflict>) {
        let mut ports = HashMap::with_capacity(descriptors.len());
        let mut conflicts = Vec::new();

        for desc in descriptors {
            let port = match u16::try_from(desc.port) {
                Ok(port) if port != 0 => port,
                _ => {
                    warn!(
                        server_id = %desc.server_id,
                        port = desc.port,
                        "ignoring server with out-of-range port"
                    );
                    continue;
                }
            };
            if let Some(previous) = ports.insert(port, desc.server_id.clone()) {
                if previous != desc.server_id {
                    conflicts.push(PortConflict {
                        port,
                        replaced: previous,
                        kept: desc.server_id.clone(),
                    });
                }
            }
        }

        (Self { ports }, conflicts)
    }

    pub fn server_id(&self, port: u16) -> Option<&str> {
        self.ports.get(&port).map(String::as_str)
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    /// The allow-list the kernel should hold for this registry.
    pub fn desired_ports(&self) -> BTreeSet<u16> {
        self.ports.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_mapping_and_port_set() {
        let (registry, conflicts) = ServerRegistry::from_descriptors(&[
            ServerDescriptor::new("srv1", 8080),
            ServerDescriptor::new("srv2", 27015),
        ]);
        assert!(conflicts.is_empty());
        assert_eq!(registry.server_id(8080), Some("srv1"));
        assert_eq!(registry.server_id(27015), Some("srv2"));
        assert_eq!(registry.server_id(9999), None);
        assert_eq!(
            registry.desired_ports().into_iter().collect::<Vec<_>>(),
            vec![8080, 27015]
        );
    }

    #[test]
    fn duplicate_port_is_last_write_wins_and_reported() {
        let (registry, conflicts) = ServerRegistry::from_descriptors(&[
            ServerDescriptor::new("first", 7777),
            ServerDescriptor::new("second", 7777),
        ]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.server_id(7777), Some("second"));
        assert_eq!(
            conflicts,
            vec![PortConflict {
                port: 7777,
                replaced: "first".into(),
                kept: "second".into(),
            }]
        );
    }

    #[test]
    fn same_server_listed_twice_is_not_a_conflict() {
        let (registry, conflicts) = ServerRegistry::from_descriptors(&[
            ServerDescriptor::new("srv1", 7777),
            ServerDescriptor::new("srv1", 7777),
        ]);
        assert_eq!(registry.len(), 1);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn out_of_range_ports_are_skipped() {
        let (registry, _) = ServerRegistry::from_descriptors(&[
            ServerDescriptor::new("zero", 0),
            ServerDescriptor::new("negative", -1),
            ServerDescriptor::new("huge", 70_000),
            ServerDescriptor::new("ok", 65_535),
        ]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains_port(65_535));
    }

    #[test]
    fn rebuild_drops_vanished_servers() {
        let (old, _) = ServerRegistry::from_descriptors(&[
            ServerDescriptor::new("srv1", 8080),
            ServerDescriptor::new("srv2", 8081),
        ]);
        let (new, _) = ServerRegistry::from_descriptors(&[ServerDescriptor::new("srv2", 8081)]);
        assert!(old.contains_port(8080));
        assert!(!new.contains_port(8080));
        assert_eq!(new.server_id(8081), Some("srv2"));
    }
}
