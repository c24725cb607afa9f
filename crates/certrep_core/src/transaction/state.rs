//! Transaction states and the transition legality table.

use std::fmt;

/// State of a replicated transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Executing statements.
    Executing,
    /// Preparing for two-phase commit.
    Preparing,
    /// Certification is in progress.
    Certifying,
    /// Certified, committing in the storage engine.
    Committing,
    /// Left the commit-order critical section.
    OrderedCommit,
    /// Committed.
    Committed,
    /// Certification failed.
    CertFailed,
    /// Marked for abort by a conflict or an error.
    MustAbort,
    /// Rolling back.
    Aborting,
    /// Rolled back.
    Aborted,
    /// Certified but aborted locally, must be replayed.
    MustReplay,
    /// Replaying.
    Replaying,
}

impl TransactionState {
    /// Every state, in table order.
    pub const ALL: [TransactionState; 12] = [
        TransactionState::Executing,
        TransactionState::Preparing,
        TransactionState::Certifying,
        TransactionState::Committing,
        TransactionState::OrderedCommit,
        TransactionState::Committed,
        TransactionState::CertFailed,
        TransactionState::MustAbort,
        TransactionState::Aborting,
        TransactionState::Aborted,
        TransactionState::MustReplay,
        TransactionState::Replaying,
    ];

    /// Returns true if moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(self, next: TransactionState) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Executing, Preparing | MustAbort)
                | (Preparing, Certifying | MustAbort)
                | (Certifying, Committing | CertFailed | MustAbort)
                | (Committing, OrderedCommit | Committing | MustAbort)
                | (OrderedCommit, Committed)
                | (CertFailed, Aborting)
                | (MustAbort, Aborting | MustReplay)
                | (Aborting, Aborted)
                | (MustReplay, Replaying)
                | (Replaying, Committing)
        )
    }

    /// Returns true if a brute-force abort may land in this state.
    #[must_use]
    pub fn accepts_bf_abort(self) -> bool {
        matches!(
            self,
            TransactionState::Executing
                | TransactionState::Preparing
                | TransactionState::Certifying
                | TransactionState::Committing
        )
    }

    /// Returns true if the transaction has reached an end state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    /// Returns the state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::Executing => "executing",
            TransactionState::Preparing => "preparing",
            TransactionState::Certifying => "certifying",
            TransactionState::Committing => "committing",
            TransactionState::OrderedCommit => "ordered_commit",
            TransactionState::Committed => "committed",
            TransactionState::CertFailed => "cert_failed",
            TransactionState::MustAbort => "must_abort",
            TransactionState::Aborting => "aborting",
            TransactionState::Aborted => "aborted",
            TransactionState::MustReplay => "must_replay",
            TransactionState::Replaying => "replaying",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransactionState::*;

    #[test]
    fn table_rows() {
        let expect: [(TransactionState, &[TransactionState]); 12] = [
            (Executing, &[Preparing, MustAbort]),
            (Preparing, &[Certifying, MustAbort]),
            (Certifying, &[Committing, CertFailed, MustAbort]),
            (Committing, &[Committing, OrderedCommit, MustAbort]),
            (OrderedCommit, &[Committed]),
            (Committed, &[]),
            (CertFailed, &[Aborting]),
            (MustAbort, &[Aborting, MustReplay]),
            (Aborting, &[Aborted]),
            (Aborted, &[]),
            (MustReplay, &[Replaying]),
            (Replaying, &[Committing]),
        ];
        for (from, allowed) in expect {
            for to in TransactionState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&to),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn bf_abort_window() {
        let accepting: Vec<_> = TransactionState::ALL
            .into_iter()
            .filter(|s| s.accepts_bf_abort())
            .collect();
        assert_eq!(accepting, vec![Executing, Preparing, Certifying, Committing]);
    }

    #[test]
    fn names() {
        assert_eq!(OrderedCommit.to_string(), "ordered_commit");
        assert_eq!(MustReplay.as_str(), "must_replay");
    }
}
