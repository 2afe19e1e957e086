//! Per-connection send priority levels.

use serde::{Deserialize, Serialize};

/// The four priority levels a connection's send queue is split into.
/// Ordered so that `VITAL > HIGH > MEDIUM > LOW` compares as expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Vital,
}

impl Priority {
    /// All levels, highest first -- the order a scheduler should poll them in.
    pub const ALL_HIGHEST_FIRST: [Priority; 4] =
        [Priority::Vital, Priority::High, Priority::Medium, Priority::Low];
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vital_outranks_everything() {
        assert!(Priority::Vital > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn default_is_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
    }
}
