//! Cross-host extraction policy.
//!
//! Extracting a file that another host synced is allowed but confirmed per
//! item. The running answer is a [`HostPolicy`] value the extraction batch
//! threads through its call chain; "all" answers stick for the rest of the
//! batch.

use serde::{Deserialize, Serialize};

use satchel_index::IndexEntry;

/// A single answer from the decision provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostDecision {
    Yes,
    No,
    YesAll,
    NoAll,
    Cancel,
}

/// Supplies decisions for files owned by another host.
pub trait HostDecisionProvider: Send + Sync {
    fn decide(&self, entry: &IndexEntry, local_host: &str) -> HostDecision;
}

/// Extract everything without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysExtract;

impl HostDecisionProvider for AlwaysExtract {
    fn decide(&self, _entry: &IndexEntry, _local_host: &str) -> HostDecision {
        HostDecision::YesAll
    }
}

/// Skip every foreign file.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExtract;

impl HostDecisionProvider for NeverExtract {
    fn decide(&self, _entry: &IndexEntry, _local_host: &str) -> HostDecision {
        HostDecision::NoAll
    }
}

/// Running cross-host state of one extraction batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPolicy {
    #[default]
    Ask,
    Yes,
    No,
    YesAll,
    NoAll,
    Cancel,
}

/// What to do with one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Extract,
    Skip,
    Cancel,
}

impl From<HostDecision> for HostPolicy {
    fn from(decision: HostDecision) -> Self {
        match decision {
            HostDecision::Yes => HostPolicy::Yes,
            HostDecision::No => HostPolicy::No,
            HostDecision::YesAll => HostPolicy::YesAll,
            HostDecision::NoAll => HostPolicy::NoAll,
            HostDecision::Cancel => HostPolicy::Cancel,
        }
    }
}

impl HostPolicy {
    /// Decide for `entry`, asking `provider` unless an "all" answer or a
    /// cancel already stands. Local entries are always extracted.
    pub fn resolve(
        &mut self,
        entry: &IndexEntry,
        local_host: &str,
        provider: &dyn HostDecisionProvider,
    ) -> PolicyOutcome {
        if entry.host == local_host {
            return PolicyOutcome::Extract;
        }

        if matches!(self, HostPolicy::Ask | HostPolicy::Yes | HostPolicy::No) {
            *self = provider.decide(entry, local_host).into();
        }

        match self {
            HostPolicy::Cancel => PolicyOutcome::Cancel,
            HostPolicy::No | HostPolicy::NoAll => PolicyOutcome::Skip,
            HostPolicy::Ask | HostPolicy::Yes | HostPolicy::YesAll => PolicyOutcome::Extract,
        }
    }
}
