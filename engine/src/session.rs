// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::action::{ActionTable, GroupKey};

/// Role a VRRP group currently holds on the paired router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Inactive,
    Active,
}

/// Last-known role per configured group.
///
/// The keyset is fixed at construction to the action table's keyset;
/// observations for other groups never create entries. Only the telemetry
/// dispatch path writes, while the reconcile loop reads snapshots, so a
/// single lightweight lock suffices.
pub struct SessionTable {
    order: Vec<GroupKey>,
    roles: Mutex<HashMap<GroupKey, Role>>,
}

impl SessionTable {
    /// Creates one entry per configured group, all Inactive.
    pub fn new(actions: &ActionTable) -> SessionTable {
        let order: Vec<GroupKey> = actions.keys().cloned().collect();
        let roles = order
            .iter()
            .map(|key| (key.clone(), Role::Inactive))
            .collect();
        SessionTable {
            order,
            roles: Mutex::new(roles),
        }
    }

    /// Replaces the stored role, returning the prior value. Unknown keys are
    /// not inserted and yield `None`.
    pub fn replace(&self, key: &GroupKey, role: Role) -> Option<Role> {
        let mut roles = self.roles.lock();
        let slot = roles.get_mut(key)?;
        let prior = *slot;
        *slot = role;
        Some(prior)
    }

    pub fn get(&self, key: &GroupKey) -> Option<Role> {
        self.roles.lock().get(key).copied()
    }

    /// (key, role) pairs in configuration order.
    pub fn snapshot(&self) -> Vec<(GroupKey, Role)> {
        let roles = self.roles.lock();
        self.order
            .iter()
            .map(|key| (key.clone(), roles[key]))
            .collect()
    }

    /// Bulk reset to Inactive, used when the telemetry stream ends and the
    /// local view of which side is active becomes stale.
    pub fn reset_all(&self) {
        for role in self.roles.lock().values_mut() {
            *role = Role::Inactive;
        }
    }

    pub fn active_count(&self) -> usize {
        self.roles
            .lock()
            .values()
            .filter(|role| **role == Role::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::{Role, SessionTable};
    use crate::action::{Action, ActionTable, GroupKey};

    fn table(keys: &[GroupKey]) -> SessionTable {
        let actions = ActionTable::new(
            keys.iter()
                .map(|key| {
                    (
                        key.clone(),
                        Action::AssignAddress {
                            device_index: 0,
                            address: "10.0.2.100".parse().unwrap(),
                        },
                    )
                })
                .collect(),
        )
        .unwrap();
        SessionTable::new(&actions)
    }

    #[test]
    fn starts_inactive_and_replaces() {
        let key = GroupKey::new("HundredGigE0/0/0/1", 1);
        let sessions = table(&[key.clone()]);

        assert_eq!(sessions.get(&key), Some(Role::Inactive));
        assert_eq!(sessions.replace(&key, Role::Active), Some(Role::Inactive));
        assert_eq!(sessions.replace(&key, Role::Active), Some(Role::Active));
        assert_eq!(sessions.active_count(), 1);
    }

    #[test]
    fn unknown_key_is_not_inserted() {
        let key = GroupKey::new("HundredGigE0/0/0/1", 1);
        let stranger = GroupKey::new("HundredGigE0/0/0/9", 7);
        let sessions = table(&[key]);

        assert_eq!(sessions.replace(&stranger, Role::Active), None);
        assert_eq!(sessions.get(&stranger), None);
        assert_eq!(sessions.snapshot().len(), 1);
    }

    #[test]
    fn reset_all_returns_every_entry_to_inactive() {
        let a = GroupKey::new("HundredGigE0/0/0/1", 1);
        let b = GroupKey::new("HundredGigE0/0/0/2", 2);
        let sessions = table(&[a.clone(), b.clone()]);

        sessions.replace(&a, Role::Active);
        sessions.replace(&b, Role::Active);
        sessions.reset_all();

        assert_eq!(sessions.get(&a), Some(Role::Inactive));
        assert_eq!(sessions.get(&b), Some(Role::Inactive));
        assert_eq!(sessions.active_count(), 0);
    }

    #[test]
    fn snapshot_preserves_configuration_order() {
        let b = GroupKey::new("HundredGigE0/0/0/2", 2);
        let a = GroupKey::new("HundredGigE0/0/0/1", 1);
        let sessions = table(&[b.clone(), a.clone()]);

        let keys: Vec<_> = sessions.snapshot().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![b, a]);
    }
}
