use std::collections::VecDeque;

use crate::config::FairnessPolicy;
use crate::session_id::StreamId;

/// Decides which sessions the outbound pump visits in a round, and how many messages each may send.
///
/// Pure bookkeeping; the pump supplies the current backlogs and does the IO.
#[derive(Debug)]
pub(crate) struct Scheduler {
    policy: FairnessPolicy,
    max_batch: usize,
    rotation: VecDeque<StreamId>,
}

/// One visit in a pump round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Visit {
    pub stream: StreamId,
    pub quota: usize,
}

impl Scheduler {
    pub(crate) fn new(policy: FairnessPolicy, max_batch: usize) -> Self {
        Self {
            policy,
            max_batch: max_batch.max(1),
            rotation: VecDeque::new(),
        }
    }

    pub(crate) fn insert(&mut self, stream: StreamId) {
        if !self.rotation.contains(&stream) {
            self.rotation.push_back(stream);
        }
    }

    pub(crate) fn remove(&mut self, stream: StreamId) {
        self.rotation.retain(|s| *s != stream);
    }

    /// Streams in the order the next round starts from.
    pub(crate) fn streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.rotation.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.rotation.len()
    }

    /// Plan one round over the streams that have something to do.
    ///
    /// `ready` holds `(stream, backlog)` pairs, where a backlog of `0` means the stream only has its
    /// end of stream left to deliver. Every ready stream gets at least one visit slot.
    pub(crate) fn plan(&mut self, ready: &[(StreamId, usize)]) -> Vec<Visit> {
        let mut visits: Vec<Visit> = self
            .streams()
            .filter_map(|stream| {
                ready
                    .iter()
                    .find(|(candidate, _)| *candidate == stream)
                    .map(|(_, backlog)| (stream, *backlog))
            })
            .map(|(stream, backlog)| Visit {
                stream,
                quota: backlog,
            })
            .collect();

        match self.policy {
            FairnessPolicy::RoundRobin => {
                for visit in &mut visits {
                    visit.quota = 1;
                }
            }
            FairnessPolicy::WeightedByBacklog => {
                let deepest = visits.iter().map(|v| v.quota).max().unwrap_or(0).max(1);
                for visit in &mut visits {
                    visit.quota = (visit.quota * self.max_batch)
                        .div_ceil(deepest)
                        .clamp(1, self.max_batch);
                }
                // Stable, so equal backlogs keep their rotation order.
                visits.sort_by(|a, b| b.quota.cmp(&a.quota));
            }
        }

        if !visits.is_empty() {
            self.rotation.rotate_left(1);
        }
        visits
    }
}
