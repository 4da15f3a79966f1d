use concord_common::error::Result;
use concord_common::types::LogIndex;
use tracing::{debug, warn};

use super::node::{Applied, RaftNode};
use super::state_machine::StateMachine;

/// Highest index present on at least `quorum` of the given match indexes
/// (which must include the leader's own last index).
pub fn quorum_index(mut matched: Vec<LogIndex>, quorum: usize) -> LogIndex {
    if quorum == 0 || matched.len() < quorum {
        return 0;
    }
    matched.sort_unstable_by(|a, b| b.cmp(a));
    matched[quorum - 1]
}

impl<S: StateMachine> RaftNode<S> {
    /// Check if a log index is safely replicated on majority → commit it.
    ///
    /// Only an entry of the current term can be committed by counting
    /// replicas; earlier entries follow along with it.
    pub(crate) fn advance_commit_index(&mut self) -> Result<()> {
        let Some(state) = self.role.leader_state() else {
            return Ok(());
        };

        let mut matched: Vec<LogIndex> = self.peers.iter().map(|p| state.match_for(p)).collect();
        matched.push(self.log.last_index());
        let candidate = quorum_index(matched, self.quorum());

        if candidate <= self.commit_index {
            return Ok(());
        }
        if self.log.term_at(candidate) != Some(self.current_term()) {
            return Ok(());
        }

        debug!(node = %self.id, from = self.commit_index, to = candidate, "commit index advanced");
        self.commit_index = candidate;
        self.metrics.inc_counter("commit_advances");
        self.metrics.observe_gauge("commit_index", candidate as f64);
        self.apply_committed()
    }

    /// Applies all entries between last_applied+1..=commit_index to the state
    /// machine, in order, then compacts the log if it grew too long.
    pub(crate) fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            if index <= self.log.snapshot_index() {
                self.last_applied = self.log.snapshot_index();
                continue;
            }

            let Some(entry) = self.log.get(index) else {
                warn!(node = %self.id, index, "committed entry missing from log");
                break;
            };
            let term = entry.term;
            let result = self.state_machine.apply(index, &entry.command);

            self.last_applied = index;
            self.ready.applied.push(Applied {
                index,
                term,
                result,
            });
            self.metrics.inc_counter("entries_applied");
        }
        self.maybe_compact()
    }
}
