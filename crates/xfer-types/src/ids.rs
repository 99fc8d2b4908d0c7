use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single trial within a tuning run.
///
/// Assigned monotonically by the scheduler, starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub u64);

impl TrialId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TrialId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
