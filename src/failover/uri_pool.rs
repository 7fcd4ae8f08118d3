//! # URI Pool
//!
//! Ordered (optionally randomised) multiset of candidate broker URIs with
//! "in-use" exclusion: an entry handed out by [`UriPool::take_next`] stays a
//! member but cannot be handed out again until it is returned, so two
//! concurrent connect attempts never target the same endpoint.
//!
//! The first entry of the configured order is the pool's priority URI.

use crate::furi::BrokerUri;
use rand::Rng;

#[derive(Debug, Clone)]
struct Entry {
    uri: BrokerUri,
    in_use: bool,
}

/// Candidate endpoint pool for the failover transport.
#[derive(Debug, Clone)]
pub struct UriPool {
    entries: Vec<Entry>,
    randomize: bool,
}

impl UriPool {
    pub fn new(randomize: bool) -> Self {
        Self { entries: Vec::new(), randomize }
    }

    pub fn with_uris(uris: Vec<BrokerUri>, randomize: bool) -> Self {
        let mut pool = Self::new(randomize);
        for uri in uris {
            pool.add(uri);
        }
        pool
    }

    pub fn set_randomize(&mut self, randomize: bool) {
        self.randomize = randomize;
    }

    pub fn is_randomize(&self) -> bool {
        self.randomize
    }

    /// True when the pool holds no entries at all, in-use or not.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when at least one entry is currently available to take.
    pub fn has_available(&self) -> bool {
        self.entries.iter().any(|e| !e.in_use)
    }

    pub fn contains(&self, uri: &BrokerUri) -> bool {
        self.entries.iter().any(|e| e.uri == *uri)
    }

    /// The head of the configured order; what a rebalance steers toward.
    pub fn priority_uri(&self) -> Option<&BrokerUri> {
        self.entries.first().map(|e| &e.uri)
    }

    pub fn is_priority(&self, uri: &BrokerUri) -> bool {
        self.priority_uri().map(|p| p == uri).unwrap_or(false)
    }

    /// Takes the next available URI and marks it in use. Order is the
    /// configured order unless randomisation is on.
    pub fn take_next(&mut self) -> Option<BrokerUri> {
        let available: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_use)
            .map(|(i, _)| i)
            .collect();
        if available.is_empty() {
            return None;
        }
        let pick = if self.randomize {
            available[rand::thread_rng().gen_range(0..available.len())]
        } else {
            available[0]
        };
        self.entries[pick].in_use = true;
        Some(self.entries[pick].uri.clone())
    }

    /// Returns a previously taken URI after a failed (or abandoned) attempt.
    /// The entry moves to the tail so other candidates are tried first on
    /// the next pass. Unknown URIs are appended as new members.
    pub fn return_uri(&mut self, uri: &BrokerUri) {
        if let Some(index) = self.entries.iter().position(|e| e.uri == *uri) {
            let mut entry = self.entries.remove(index);
            entry.in_use = false;
            self.entries.push(entry);
        } else {
            self.entries.push(Entry { uri: uri.clone(), in_use: false });
        }
    }

    /// Adds a URI if not already a member. Returns whether the pool changed.
    pub fn add(&mut self, uri: BrokerUri) -> bool {
        if self.contains(&uri) {
            return false;
        }
        self.entries.push(Entry { uri, in_use: false });
        true
    }

    /// Removes a URI entirely. Returns whether the pool changed.
    pub fn remove(&mut self, uri: &BrokerUri) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.uri != *uri);
        self.entries.len() != before
    }

    pub fn add_all(&mut self, uris: &[BrokerUri]) -> bool {
        let mut changed = false;
        for uri in uris {
            if self.add(uri.clone()) {
                changed = true;
            }
        }
        changed
    }

    pub fn remove_all(&mut self, uris: &[BrokerUri]) -> bool {
        let mut changed = false;
        for uri in uris {
            if self.remove(uri) {
                changed = true;
            }
        }
        changed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Every member, in pool order, regardless of in-use state.
    pub fn uri_list(&self) -> Vec<BrokerUri> {
        self.entries.iter().map(|e| e.uri.clone()).collect()
    }

    /// Membership equality, order-insensitive. Used to decide whether a
    /// broker-pushed update actually changed anything.
    pub fn same_members(&self, other: &UriPool) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|e| other.contains(&e.uri))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(port: u16) -> BrokerUri {
        BrokerUri::parse(&format!("tcp://127.0.0.1:{port}")).unwrap()
    }

    #[test]
    fn ordered_take_and_in_use_exclusion() {
        let mut pool = UriPool::with_uris(vec![uri(1), uri(2)], false);
        assert_eq!(pool.take_next(), Some(uri(1)));
        // Taken entry is excluded until returned, but still a member.
        assert_eq!(pool.take_next(), Some(uri(2)));
        assert_eq!(pool.take_next(), None);
        assert!(pool.contains(&uri(1)));
        assert!(!pool.has_available());

        pool.return_uri(&uri(1));
        assert!(pool.has_available());
        assert_eq!(pool.take_next(), Some(uri(1)));
    }

    #[test]
    fn returned_uri_goes_to_the_tail() {
        let mut pool = UriPool::with_uris(vec![uri(1), uri(2), uri(3)], false);
        let first = pool.take_next().unwrap();
        assert_eq!(first, uri(1));
        pool.return_uri(&first);
        // 2 and 3 are tried before 1 comes around again.
        assert_eq!(pool.take_next(), Some(uri(2)));
        assert_eq!(pool.take_next(), Some(uri(3)));
        assert_eq!(pool.take_next(), Some(uri(1)));
    }

    #[test]
    fn add_and_remove_report_changes() {
        let mut pool = UriPool::new(false);
        assert!(pool.add(uri(1)));
        assert!(!pool.add(uri(1)));
        assert!(pool.add_all(&[uri(1), uri(2)]));
        assert!(!pool.add_all(&[uri(1), uri(2)]));
        assert!(pool.remove(&uri(1)));
        assert!(!pool.remove(&uri(1)));
        assert!(pool.remove_all(&[uri(2)]));
        assert!(pool.is_empty());
    }

    #[test]
    fn priority_is_the_configured_head() {
        let pool = UriPool::with_uris(vec![uri(7), uri(8)], true);
        assert!(pool.is_priority(&uri(7)));
        assert!(!pool.is_priority(&uri(8)));
    }

    #[test]
    fn randomized_take_still_covers_every_member() {
        let mut pool = UriPool::with_uris(vec![uri(1), uri(2), uri(3)], true);
        let mut taken = Vec::new();
        while let Some(uri) = pool.take_next() {
            taken.push(uri);
        }
        assert_eq!(taken.len(), 3);
        for expected in [uri(1), uri(2), uri(3)] {
            assert!(taken.contains(&expected));
        }
    }

    #[test]
    fn member_set_equality_ignores_order() {
        let a = UriPool::with_uris(vec![uri(1), uri(2)], false);
        let b = UriPool::with_uris(vec![uri(2), uri(1)], false);
        let c = UriPool::with_uris(vec![uri(2)], false);
        assert!(a.same_members(&b));
        assert!(!a.same_members(&c));
    }
}
