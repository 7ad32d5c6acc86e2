//! Peer filters: which peers a scenario event applies to.

use std::collections::BTreeSet;

use crate::error::CoreError;
use crate::metadata::PeerId;

/// Restricts a scenario event to a subset of peers.
///
/// Written in scenario files as a trailing brace group:
///
/// ```text
/// 0:05 start_download {1,3,5-7}     # only peers 1, 3, 5, 6, 7
/// 0:10 churn {!2}                   # every peer except 2
/// 0:15 annotate phase-two           # no braces: all peers
/// ```
///
/// A leading `!` negates the whole set. An empty group means "all peers".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFilter {
    /// Applies to every peer.
    All,
    /// Applies only to the listed peers.
    Include(BTreeSet<PeerId>),
    /// Applies to every peer except the listed ones.
    Exclude(BTreeSet<PeerId>),
}

impl PeerFilter {
    /// Parses the inside of a `{...}` group, braces already stripped.
    pub fn from_spec(spec: &str) -> Result<Self, CoreError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(PeerFilter::All);
        }

        let (negated, body) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };

        let mut ids = BTreeSet::new();
        for part in body.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((low, high)) => {
                    let low: PeerId = low
                        .trim()
                        .parse()
                        .map_err(|_| CoreError::FilterSpec(spec.to_string()))?;
                    let high: PeerId = high
                        .trim()
                        .parse()
                        .map_err(|_| CoreError::FilterSpec(spec.to_string()))?;
                    if low > high {
                        return Err(CoreError::FilterSpec(spec.to_string()));
                    }
                    ids.extend(low..=high);
                }
                None => {
                    let id: PeerId = part
                        .parse()
                        .map_err(|_| CoreError::FilterSpec(spec.to_string()))?;
                    ids.insert(id);
                }
            }
        }

        if ids.is_empty() {
            return Ok(PeerFilter::All);
        }

        Ok(if negated {
            PeerFilter::Exclude(ids)
        } else {
            PeerFilter::Include(ids)
        })
    }

    /// Returns true if the event this filter guards applies to `peer`.
    pub fn matches(&self, peer: PeerId) -> bool {
        match self {
            PeerFilter::All => true,
            PeerFilter::Include(ids) => ids.contains(&peer),
            PeerFilter::Exclude(ids) => !ids.contains(&peer),
        }
    }
}

impl Default for PeerFilter {
    fn default() -> Self {
        PeerFilter::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_spec_is_all() {
        assert_eq!(PeerFilter::from_spec("").unwrap(), PeerFilter::All);
        assert_eq!(PeerFilter::from_spec("  ").unwrap(), PeerFilter::All);
        assert!(PeerFilter::All.matches(1));
        assert!(PeerFilter::All.matches(9999));
    }

    #[test]
    fn test_include_list_and_ranges() {
        let filter = PeerFilter::from_spec("1,3,5-7").unwrap();
        assert!(filter.matches(1));
        assert!(!filter.matches(2));
        assert!(filter.matches(3));
        assert!(!filter.matches(4));
        assert!(filter.matches(5));
        assert!(filter.matches(6));
        assert!(filter.matches(7));
        assert!(!filter.matches(8));
    }

    #[test]
    fn test_negation_excludes_whole_set() {
        let filter = PeerFilter::from_spec("!3").unwrap();
        assert!(filter.matches(1));
        assert!(filter.matches(2));
        assert!(!filter.matches(3));
        assert!(filter.matches(4));

        let filter = PeerFilter::from_spec("!1-2,5").unwrap();
        assert!(!filter.matches(1));
        assert!(!filter.matches(2));
        assert!(filter.matches(3));
        assert!(!filter.matches(5));
    }

    #[test]
    fn test_malformed_specs_rejected() {
        assert!(PeerFilter::from_spec("a,b").is_err());
        assert!(PeerFilter::from_spec("5-1").is_err());
        assert!(PeerFilter::from_spec("1,,x").is_err());
    }
}
