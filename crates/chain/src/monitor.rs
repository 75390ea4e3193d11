//! Double-sign monitoring.

use crate::cache::LruMap;
use metrics::counter;
use parking_lot::Mutex;
use tracing::error;
use trellis_primitives::{BlockNumber, SealedHeader};

/// Number of recent heights the monitor keeps headers for.
const MAX_CACHE_HEADER: u32 = 100;

/// Watches observed headers for two different proposals at the same height
/// carrying the same proposer tag.
///
/// Purely observational: a hit is logged and counted, never acted upon.
#[derive(Debug)]
pub struct DoubleSignMonitor {
    history: Mutex<LruMap<BlockNumber, Vec<SealedHeader>>>,
}

impl Default for DoubleSignMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleSignMonitor {
    /// Creates an empty monitor.
    pub fn new() -> Self {
        Self { history: Mutex::new(LruMap::new(MAX_CACHE_HEADER)) }
    }

    /// Checks `header` against the other headers seen at its height.
    ///
    /// Returns whether a double sign was detected.
    pub fn verify(&self, header: &SealedHeader) -> bool {
        let mut history = self.history.lock();
        let seen = history.get_or_insert(header.number, Vec::new);
        let Some(seen) = seen else { return false };

        let mut detected = false;
        for other in seen.iter() {
            if other.hash() != header.hash() && other.extra == header.extra {
                error!(
                    number = header.number,
                    first = %other.hash(),
                    second = %header.hash(),
                    "Double-signed headers detected"
                );
                counter!("chain.monitor.doublesign").increment(1);
                detected = true;
            }
        }
        if !seen.iter().any(|other| other.hash() == header.hash()) {
            seen.push(header.clone());
        }
        detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_primitives::{Bytes, Header};

    fn header(number: BlockNumber, extra: &'static [u8], time: u64) -> SealedHeader {
        Header { number, extra: Bytes::from_static(extra), time, ..Default::default() }.seal_slow()
    }

    #[test]
    fn same_proposer_two_blocks_one_height() {
        let monitor = DoubleSignMonitor::new();
        assert!(!monitor.verify(&header(5, b"val-1", 100)));
        assert!(monitor.verify(&header(5, b"val-1", 101)));
    }

    #[test]
    fn different_proposers_are_fine() {
        let monitor = DoubleSignMonitor::new();
        assert!(!monitor.verify(&header(5, b"val-1", 100)));
        assert!(!monitor.verify(&header(5, b"val-2", 100)));
    }

    #[test]
    fn re_observing_the_same_header_is_fine() {
        let monitor = DoubleSignMonitor::new();
        let h = header(7, b"val-1", 100);
        assert!(!monitor.verify(&h));
        assert!(!monitor.verify(&h));
    }
}
