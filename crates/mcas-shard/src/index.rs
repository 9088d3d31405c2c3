//! Optional per-pool secondary index.
//!
//! A volatile ordered key set, built on demand via
//! `CONFIGURE("AddIndex::VolatileTree")` and rebuilt by enumerating the
//! backend. Find walks the set from a start position with a bounded
//! comparison budget so callers can spread long scans across ticks.

use std::collections::{BTreeSet, HashMap};

use mcas_ado_proto::FindType;
use mcas_backend::PoolHandle;
use regex::Regex;

/// Result of one bounded find step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindOutcome {
    /// A key matched at this position.
    Found {
        /// Position of the match in index order.
        position: u64,
        /// The matched key.
        key: String,
    },
    /// The scan reached the end without a match.
    Exhausted,
    /// The comparison budget ran out; resume from `next_position`.
    More {
        /// Position to resume from.
        next_position: u64,
    },
}

/// One pool's volatile tree index.
#[derive(Debug, Default)]
pub struct VolatileIndex {
    keys: BTreeSet<String>,
}

impl VolatileIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key.
    pub fn insert(&mut self, key: &str) {
        self.keys.insert(key.to_string());
    }

    /// Remove a key.
    pub fn remove(&mut self, key: &str) {
        self.keys.remove(key);
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Scan from `begin_pos` for a key matching `expression` under
    /// `find_type`, visiting at most `budget` keys.
    ///
    /// Regex expressions match anywhere in the key (unanchored).
    pub fn find(
        &self,
        expression: &str,
        begin_pos: u64,
        find_type: FindType,
        budget: usize,
    ) -> Result<FindOutcome, regex::Error> {
        let matcher: Box<dyn Fn(&str) -> bool> = match find_type {
            FindType::Regex => {
                let re = Regex::new(expression)?;
                Box::new(move |k: &str| re.is_match(k))
            }
            FindType::Prefix => {
                let prefix = expression.to_string();
                Box::new(move |k: &str| k.starts_with(&prefix))
            }
            FindType::Exact => {
                let exact = expression.to_string();
                Box::new(move |k: &str| k == exact)
            }
        };

        let mut pos = begin_pos;
        for (visited, key) in self.keys.iter().skip(begin_pos as usize).enumerate() {
            if visited >= budget {
                return Ok(FindOutcome::More { next_position: pos });
            }
            if matcher(key) {
                return Ok(FindOutcome::Found {
                    position: pos,
                    key: key.clone(),
                });
            }
            pos += 1;
        }
        Ok(FindOutcome::Exhausted)
    }
}

/// The per-pool index map, present only after `AddIndex::`.
#[derive(Debug, Default)]
pub struct IndexMap {
    indices: HashMap<PoolHandle, VolatileIndex>,
}

impl IndexMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an (empty) index for `pool`, replacing any existing one.
    pub fn install(&mut self, pool: PoolHandle) -> &mut VolatileIndex {
        self.indices.insert(pool, VolatileIndex::new());
        self.indices.get_mut(&pool).unwrap_or_else(|| unreachable!())
    }

    /// Remove the index for `pool`. Returns whether one existed.
    pub fn remove(&mut self, pool: PoolHandle) -> bool {
        self.indices.remove(&pool).is_some()
    }

    /// The index for `pool`, if installed.
    pub fn get(&self, pool: PoolHandle) -> Option<&VolatileIndex> {
        self.indices.get(&pool)
    }

    /// Mutable access to the index for `pool`, if installed.
    pub fn get_mut(&mut self, pool: PoolHandle) -> Option<&mut VolatileIndex> {
        self.indices.get_mut(&pool)
    }

    /// Record a key if `pool` has an index.
    pub fn add_key(&mut self, pool: PoolHandle, key: &str) {
        if let Some(index) = self.indices.get_mut(&pool) {
            index.insert(key);
        }
    }

    /// Remove a key if `pool` has an index.
    pub fn remove_key(&mut self, pool: PoolHandle, key: &str) {
        if let Some(index) = self.indices.get_mut(&pool) {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VolatileIndex {
        let mut idx = VolatileIndex::new();
        for k in ["cat/1", "cat/2", "dog/1", "zebra"] {
            idx.insert(k);
        }
        idx
    }

    #[test]
    fn test_find_advances_position_across_calls() {
        let idx = sample();
        let first = idx.find("cat/", 0, FindType::Regex, 100).unwrap();
        let FindOutcome::Found { position, key } = first else {
            panic!("expected a match");
        };
        assert_eq!((position, key.as_str()), (0, "cat/1"));

        let second = idx.find("cat/", position + 1, FindType::Regex, 100).unwrap();
        let FindOutcome::Found { position, key } = second else {
            panic!("expected a match");
        };
        assert_eq!((position, key.as_str()), (1, "cat/2"));

        let third = idx.find("cat/", position + 1, FindType::Regex, 100).unwrap();
        assert_eq!(third, FindOutcome::Exhausted);
    }

    #[test]
    fn test_find_budget_yields_more() {
        let idx = sample();
        let r = idx.find("zebra", 0, FindType::Exact, 2).unwrap();
        assert_eq!(r, FindOutcome::More { next_position: 2 });
        let r = idx.find("zebra", 2, FindType::Exact, 2).unwrap();
        assert_eq!(
            r,
            FindOutcome::Found { position: 3, key: "zebra".to_string() }
        );
    }

    #[test]
    fn test_prefix_and_exact_modes() {
        let idx = sample();
        assert!(matches!(
            idx.find("dog/", 0, FindType::Prefix, 100).unwrap(),
            FindOutcome::Found { key, .. } if key == "dog/1"
        ));
        assert_eq!(
            idx.find("dog", 0, FindType::Exact, 100).unwrap(),
            FindOutcome::Exhausted
        );
    }

    #[test]
    fn test_bad_regex_is_an_error() {
        let idx = sample();
        assert!(idx.find("ca(t", 0, FindType::Regex, 10).is_err());
    }

    #[test]
    fn test_index_map_mutation() {
        let mut map = IndexMap::new();
        map.add_key(1, "ignored");
        assert!(map.get(1).is_none());
        map.install(1);
        map.add_key(1, "k");
        assert_eq!(map.get(1).unwrap().len(), 1);
        map.remove_key(1, "k");
        assert!(map.get(1).unwrap().is_empty());
        assert!(map.remove(1));
        assert!(!map.remove(1));
    }
}
