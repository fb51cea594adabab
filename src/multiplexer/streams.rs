//! Which stream ids a connection has already used.
//!
//! Peers allocate stream ids in increasing order per parity, as in HTTP/2, so a high-water mark per
//! parity covers every id that was ever opened. Ids the peer jumped over are remembered separately,
//! because their first frames may still arrive a little out of order.

use std::collections::BTreeSet;

use crate::session_id::StreamId;

/// Skipped ids beyond this are not remembered and count as retired.
const MAX_SKIPPED: usize = 1024;

#[derive(Debug)]
pub(crate) struct StreamLedger {
    /// Lowest id not yet reached, for even and odd ids.
    next: [StreamId; 2],
    /// Ids below `next` that were skipped over and may still open a stream.
    skipped: BTreeSet<StreamId>,
}

impl StreamLedger {
    pub(crate) fn new() -> Self {
        Self {
            next: [0, 1],
            skipped: BTreeSet::new(),
        }
    }

    /// Claim `stream` for a new session. Returns `false` if the id was used before.
    pub(crate) fn claim(&mut self, stream: StreamId) -> bool {
        let parity = (stream % 2) as usize;
        let next = self.next[parity];

        if stream < next {
            return self.skipped.remove(&stream);
        }

        let gap = usize::try_from((stream - next) / 2).unwrap_or(usize::MAX);
        if self.skipped.len().saturating_add(gap) <= MAX_SKIPPED {
            self.skipped.extend((next..stream).step_by(2));
        }
        self.next[parity] = stream.saturating_add(2);
        true
    }

    /// Number of skipped ids still remembered.
    pub(crate) fn skipped(&self) -> usize {
        self.skipped.len()
    }
}

impl Default for StreamLedger {
    fn default() -> Self {
        Self::new()
    }
}
