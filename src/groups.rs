//! Group membership: which counters make up one logical device.

use std::collections::HashMap;

use anyhow::Result;

use crate::models::Group;

#[async_trait::async_trait]
pub trait GroupDirectory: Send + Sync {
    /// `Ok(None)` when the group is unknown; `Err` only when the directory
    /// itself cannot be reached.
    async fn resolve(&self, group_id: &str) -> Result<Option<Group>>;
}

/// Directory built from the `[[groups]]` configuration section.
#[derive(Debug, Clone, Default)]
pub struct StaticGroupDirectory {
    groups: HashMap<String, Group>,
}

impl StaticGroupDirectory {
    pub fn new(groups: impl IntoIterator<Item = Group>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
        }
    }

    /// Group owning `counter_id`, if any.
    pub fn group_of(&self, counter_id: &str) -> Option<&Group> {
        self.groups.values().find(|g| g.counter(counter_id).is_some())
    }
}

#[async_trait::async_trait]
impl GroupDirectory for StaticGroupDirectory {
    async fn resolve(&self, group_id: &str) -> Result<Option<Group>> {
        Ok(self.groups.get(group_id).cloned())
    }
}
