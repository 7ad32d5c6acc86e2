//! Peer records and the merged metadata table.
//!
//! During rendezvous every peer uploads key/value pairs it discovered at
//! start-up (listen addresses, generated keys, measured clock offsets).
//! The coordinator merges them into one [`MetadataTable`], frozen at the
//! barrier and pushed verbatim to every peer, so adapter code on any peer
//! can look up what every other peer published.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Ordinal peer identifier, assigned by the coordinator in connection
/// order, 1..=N for an experiment of N peers.
pub type PeerId = u32;

/// Schema version of the wire form of [`MetadataTable`].
///
/// The table crosses a process boundary as a single JSON line; the version
/// tag lets a reader reject tables produced by an incompatible build
/// instead of misinterpreting them.
pub const WIRE_VERSION: u32 = 1;

/// Everything the coordinator knows about one peer at the barrier.
///
/// Frozen once the peer signals readiness; the copy every peer receives is
/// read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Ordinal id assigned by the coordinator.
    pub id: PeerId,

    /// Remote address the peer connected from.
    pub address: String,

    /// Coordinator clock minus peer clock at registration, in seconds.
    pub clock_offset: f64,

    /// Free-form key/value pairs the peer uploaded before readiness.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// The merged, immutable metadata of all peers in one experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataTable {
    /// Wire schema version, always [`WIRE_VERSION`] for tables built here.
    pub version: u32,

    /// Peer records keyed by ordinal id.
    pub peers: BTreeMap<PeerId, PeerRecord>,
}

impl MetadataTable {
    /// Builds a table from the given records, tagged with the current
    /// wire version.
    pub fn new(records: impl IntoIterator<Item = PeerRecord>) -> Self {
        Self {
            version: WIRE_VERSION,
            peers: records.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    /// Returns the record for one peer, if present.
    pub fn get(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    /// Number of peers in the table.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True if the table holds no peers.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Serializes the table to its single-line wire form.
    pub fn to_wire_line(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::metadata(e.to_string()))
    }

    /// Parses a table from its wire form, rejecting unknown versions.
    pub fn from_wire_line(line: &str) -> Result<Self, CoreError> {
        let table: MetadataTable =
            serde_json::from_str(line).map_err(|e| CoreError::metadata(e.to_string()))?;
        if table.version != WIRE_VERSION {
            return Err(CoreError::UnsupportedVersion {
                found: table.version,
                expected: WIRE_VERSION,
            });
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: PeerId, offset: f64, vars: &[(&str, &str)]) -> PeerRecord {
        PeerRecord {
            id,
            address: format!("10.0.0.{id}:7000"),
            clock_offset: offset,
            vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_wire_round_trip_preserves_content() {
        let table = MetadataTable::new(vec![
            record(1, -0.25, &[("port", "8001"), ("key", "abc")]),
            record(2, 0.125, &[("port", "8002")]),
        ]);

        let line = table.to_wire_line().unwrap();
        assert!(!line.contains('\n'));

        let parsed = MetadataTable::from_wire_line(&line).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(parsed.get(1).unwrap().vars["key"], "abc");
    }

    #[test]
    fn test_unknown_version_rejected() {
        let line = r#"{"version":99,"peers":{}}"#;
        match MetadataTable::from_wire_line(line) {
            Err(CoreError::UnsupportedVersion { found: 99, .. }) => {}
            other => panic!("expected version error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_metadata_error() {
        assert!(matches!(
            MetadataTable::from_wire_line("ready"),
            Err(CoreError::Metadata(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            entries in proptest::collection::btree_map(
                1u32..64,
                (any::<i32>(), proptest::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..4)),
                1..8,
            )
        ) {
            let table = MetadataTable::new(entries.into_iter().map(|(id, (off, vars))| PeerRecord {
                id,
                address: format!("peer-{id}"),
                clock_offset: off as f64 / 1000.0,
                vars,
            }));
            let parsed = MetadataTable::from_wire_line(&table.to_wire_line().unwrap()).unwrap();
            prop_assert_eq!(parsed, table);
        }
    }
}
