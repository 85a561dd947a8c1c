//! Claim predicates for every job kind.
//!
//! Each kind names a table, the claimant column, and the predicate that makes
//! a row claimable by a given worker: unclaimed, or already claimed by that
//! same worker and not finished. A worker that dies mid-job keeps its claim
//! forever; there is no lease expiry.

use std::fmt;

/// A claimable row type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// `chat_completion_requests`, finished once `done` is set.
    ChatCompletion,
    /// Runs for the model-call worker: freshly queued, or resumed after a
    /// tool round-trip by the worker that already holds them.
    Run,
    /// Runs whose built-in tool calls wait for the tool-step worker.
    RunToolStep,
}

impl JobKind {
    pub fn table(&self) -> &'static str {
        match self {
            Self::ChatCompletion => "chat_completion_requests",
            Self::Run | Self::RunToolStep => "runs",
        }
    }

    /// Column holding the claimant id.
    pub fn claim_column(&self) -> &'static str {
        match self {
            Self::ChatCompletion | Self::Run => "claimed_by",
            Self::RunToolStep => "system_claimed_by",
        }
    }

    /// WHERE clause selecting claimable rows; `?1` is the worker id.
    pub fn claim_predicate(&self) -> &'static str {
        match self {
            Self::ChatCompletion => "(claimed_by IS NULL OR (claimed_by = ?1 AND done = 0))",
            Self::Run => {
                "((claimed_by IS NULL AND status = 'queued') \
                 OR (claimed_by = ?1 AND status = 'in_progress' AND system_status = 'queued'))"
            }
            Self::RunToolStep => {
                "(status = 'in_progress' AND system_status = 'requires_action' \
                 AND (system_claimed_by IS NULL OR system_claimed_by = ?1))"
            }
        }
    }

    /// SELECT picking the next claimable id.
    ///
    /// Ties break newest-first, which can starve old rows under load.
    pub fn select_sql(&self) -> String {
        format!(
            "SELECT id FROM {} WHERE {} ORDER BY created_at DESC LIMIT 1",
            self.table(),
            self.claim_predicate()
        )
    }

    /// UPDATE recording the claim; `?1` is the worker id, `?2` the row id.
    pub fn claim_sql(&self) -> String {
        format!(
            "UPDATE {} SET {} = ?1 WHERE id = ?2",
            self.table(),
            self.claim_column()
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ChatCompletion => "chat_completion",
            Self::Run => "run",
            Self::RunToolStep => "run_tool_step",
        };
        f.write_str(s)
    }
}
