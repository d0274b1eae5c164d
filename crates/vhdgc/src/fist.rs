//! Named fault-injection points for crash-recovery testing.

use std::collections::HashSet;

use tracing::warn;
use vhdgc_proto::{GcError, GcResult};

pub const LEAF_BEFORE_COALESCE: &str = "leaf_before_coalesce";
pub const LEAF_AFTER_COALESCE: &str = "leaf_after_coalesce";
pub const LEAF_ONE_RENAMED: &str = "leaf_one_renamed";
pub const LEAF_BOTH_RENAMED: &str = "leaf_both_renamed";
pub const LEAF_BEFORE_DELETE: &str = "leaf_before_delete";
pub const LEAF_AFTER_DELETE: &str = "leaf_after_delete";
pub const LEAF_BEFORE_REMOVE_JOURNAL: &str = "leaf_before_remove_journal";
pub const LEAF_STOP_AFTER_RECOVERY: &str = "leaf_stop_after_recovery";
pub const COALESCE_BEFORE_RELINK_JOURNAL: &str = "coalesce_before_relink_journal";

#[derive(Debug, Clone, Default)]
pub struct FistPoints {
    active: HashSet<String>,
}

impl FistPoints {
    pub fn new<I, S>(points: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active: points.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains(name)
    }

    /// Fail with a transient error if `name` is active.
    pub fn activate(&self, name: &str) -> GcResult<()> {
        if self.is_active(name) {
            warn!("fist: {} triggered", name);
            return Err(GcError::failed(format!("fault point {} triggered", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_active_points_fail() {
        let fist = FistPoints::new([LEAF_ONE_RENAMED]);
        assert!(fist.activate(LEAF_ONE_RENAMED).is_err());
        assert!(fist.activate(LEAF_BOTH_RENAMED).is_ok());
        assert!(FistPoints::default().activate(LEAF_ONE_RENAMED).is_ok());
    }
}
