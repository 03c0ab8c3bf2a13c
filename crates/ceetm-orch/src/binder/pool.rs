//! Per-domain link index bookkeeping.

use std::collections::{BTreeSet, HashMap};

use ceetm_qman::{DomainId, QmanError, QmanResult};

/// Tracks which link indices of each queue-manager domain are held.
///
/// Owned by the binder, so every update happens under the orchestrator's
/// state lock together with the hardware claim it accounts for.
#[derive(Debug, Clone)]
pub struct DomainResourcePool {
    links_per_domain: u8,
    held: HashMap<DomainId, BTreeSet<u8>>,
}

impl DomainResourcePool {
    pub fn new(links_per_domain: u8) -> Self {
        Self {
            links_per_domain,
            held: HashMap::new(),
        }
    }

    pub fn links_per_domain(&self) -> u8 {
        self.links_per_domain
    }

    pub fn claim_link_index(&mut self, domain: DomainId, index: u8) -> QmanResult<()> {
        if index >= self.links_per_domain {
            return Err(QmanError::not_available(
                "link",
                format!("{} has {} links, index {} requested", domain, self.links_per_domain, index),
            ));
        }
        if !self.held.entry(domain).or_default().insert(index) {
            return Err(QmanError::busy("link", format!("{}/{}", domain, index)));
        }
        Ok(())
    }

    /// Returns false if the index was not held.
    pub fn release_link_index(&mut self, domain: DomainId, index: u8) -> bool {
        let Some(indices) = self.held.get_mut(&domain) else {
            return false;
        };
        let removed = indices.remove(&index);
        if indices.is_empty() {
            self.held.remove(&domain);
        }
        removed
    }

    pub fn is_held(&self, domain: DomainId, index: u8) -> bool {
        self.held
            .get(&domain)
            .is_some_and(|indices| indices.contains(&index))
    }

    /// Number of link indices held in the domain.
    pub fn outstanding(&self, domain: DomainId) -> usize {
        self.held.get(&domain).map_or(0, BTreeSet::len)
    }

    /// Lowest index of the domain nobody holds.
    pub fn next_free(&self, domain: DomainId) -> Option<u8> {
        (0..self.links_per_domain).find(|index| !self.is_held(domain, *index))
    }
}

impl Default for DomainResourcePool {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_release() {
        let mut pool = DomainResourcePool::new(4);
        let dcp = DomainId(0);
        pool.claim_link_index(dcp, 1).unwrap();
        assert!(pool.is_held(dcp, 1));
        assert_eq!(pool.outstanding(dcp), 1);
        assert_eq!(pool.next_free(dcp), Some(0));

        assert!(pool.release_link_index(dcp, 1));
        assert!(!pool.release_link_index(dcp, 1));
        assert_eq!(pool.outstanding(dcp), 0);
    }

    #[test]
    fn test_double_claim_is_busy() {
        let mut pool = DomainResourcePool::new(4);
        pool.claim_link_index(DomainId(1), 2).unwrap();
        let err = pool.claim_link_index(DomainId(1), 2).unwrap_err();
        assert!(matches!(err, QmanError::Busy { .. }));
        // other domains are independent
        pool.claim_link_index(DomainId(0), 2).unwrap();
    }

    #[test]
    fn test_index_beyond_domain() {
        let mut pool = DomainResourcePool::new(2);
        let err = pool.claim_link_index(DomainId(0), 2).unwrap_err();
        assert!(matches!(err, QmanError::NotAvailable { .. }));
        assert!(err.is_exhausted());
    }

    #[test]
    fn test_full_domain() {
        let mut pool = DomainResourcePool::new(2);
        pool.claim_link_index(DomainId(0), 0).unwrap();
        pool.claim_link_index(DomainId(0), 1).unwrap();
        assert_eq!(pool.next_free(DomainId(0)), None);
    }
}
