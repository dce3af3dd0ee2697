//! Ordered, indexed policy matching.
//!
//! Policies are append-only and matched in ascending insertion order: the
//! first policy whose conditions are all satisfied wins. A per-field
//! inverted index (`field -> value -> candidate insertion orders`) avoids a
//! full linear scan on every connection; the final verification against the
//! original `Policy` always re-checks every condition so the index can
//! never itself decide a match.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;

use crate::error::FirewallError;
use crate::models::{Connection, ConnectionField, ConditionValue, Policy};

#[derive(Default)]
struct Index {
    /// field -> value -> insertion orders of policies with a condition on
    /// (field, value).
    by_condition: HashMap<ConnectionField, HashMap<ConditionValue, BTreeSet<u64>>>,
    /// Policies with no conditions match every connection; they aren't
    /// reachable through `by_condition` so they're tracked separately.
    unconditional: BTreeSet<u64>,
}

struct Inner {
    policies: HashMap<String, Policy>,
    order_to_id: HashMap<u64, String>,
    index: Index,
    next_order: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            policies: HashMap::new(),
            order_to_id: HashMap::new(),
            index: Index::default(),
            next_order: 0,
        }
    }

    fn index_policy(&mut self, policy: &Policy) {
        if policy.conditions.is_empty() {
            self.index.unconditional.insert(policy.insertion_order);
            return;
        }
        for condition in &policy.conditions {
            self.index
                .by_condition
                .entry(condition.field)
                .or_default()
                .entry(condition.value.clone())
                .or_default()
                .insert(policy.insertion_order);
        }
    }

    fn candidate_orders(&self, connection: &Connection) -> BTreeSet<u64> {
        let mut candidates = self.index.unconditional.clone();
        for field in [
            ConnectionField::SourceIp,
            ConnectionField::DestinationIp,
            ConnectionField::DestinationPort,
            ConnectionField::Protocol,
        ] {
            let value = connection.field_value(field);
            if let Some(by_value) = self.index.by_condition.get(&field) {
                if let Some(orders) = by_value.get(&value) {
                    candidates.extend(orders.iter().copied());
                }
            }
        }
        candidates
    }
}

fn matches(policy: &Policy, connection: &Connection) -> bool {
    policy
        .conditions
        .iter()
        .all(|condition| connection.field_value(condition.field) == condition.value)
}

/// Shared, concurrently readable policy store.
pub struct PolicyManager {
    inner: RwLock<Inner>,
}

impl PolicyManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Validates and appends `policy`. Fails with `PolicyConflict` if
    /// `policy_id` is already in use, leaving existing state unchanged.
    pub async fn add_policy(&self, mut policy: Policy) -> Result<Policy, FirewallError> {
        policy.validate()?;

        let mut inner = self.inner.write().await;
        if inner.policies.contains_key(&policy.policy_id) {
            return Err(FirewallError::PolicyConflict(policy.policy_id));
        }

        let order = inner.next_order;
        inner.next_order += 1;
        policy.insertion_order = order;

        inner.index_policy(&policy);
        inner.order_to_id.insert(order, policy.policy_id.clone());
        inner.policies.insert(policy.policy_id.clone(), policy.clone());

        Ok(policy)
    }

    /// The first (by insertion order) policy all of whose conditions match
    /// `connection`, or `None` if no policy matches.
    pub async fn get_matching_policy(&self, connection: &Connection) -> Option<Policy> {
        let inner = self.inner.read().await;
        let candidates = inner.candidate_orders(connection);

        for order in candidates {
            let Some(policy_id) = inner.order_to_id.get(&order) else {
                continue;
            };
            let Some(policy) = inner.policies.get(policy_id) else {
                continue;
            };
            if matches(policy, connection) {
                return Some(policy.clone());
            }
        }
        None
    }

    /// Removes every policy, resetting insertion order back to zero.
    pub async fn clear_policies(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::new();
    }

    pub async fn policy_count(&self) -> usize {
        self.inner.read().await.policies.len()
    }
}

impl Default for PolicyManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operator, PolicyAction, PolicyCondition};
    use chrono::Utc;

    fn connection(source_ip: &str, dest_port: u16, protocol: &str) -> Connection {
        Connection {
            connection_id: "c1".to_string(),
            source_ip: source_ip.to_string(),
            destination_ip: "8.8.8.8".to_string(),
            destination_port: dest_port,
            protocol: protocol.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn policy(id: &str, conditions: Vec<PolicyCondition>, action: PolicyAction) -> Policy {
        Policy {
            policy_id: id.to_string(),
            conditions,
            action,
            insertion_order: 0,
        }
    }

    fn port_condition(port: u16) -> PolicyCondition {
        PolicyCondition {
            field: ConnectionField::DestinationPort,
            operator: Operator::Eq,
            value: ConditionValue::Port(port),
        }
    }

    fn ip_condition(ip: &str) -> PolicyCondition {
        PolicyCondition {
            field: ConnectionField::SourceIp,
            operator: Operator::Eq,
            value: ConditionValue::Str(ip.to_string()),
        }
    }

    #[tokio::test]
    async fn duplicate_policy_id_is_rejected_and_state_is_unchanged() {
        let manager = PolicyManager::new();
        manager
            .add_policy(policy("p1", vec![], PolicyAction::Allow))
            .await
            .unwrap();

        let err = manager
            .add_policy(policy("p1", vec![], PolicyAction::Block))
            .await;
        assert!(err.is_err());
        assert_eq!(manager.policy_count().await, 1);
    }

    #[tokio::test]
    async fn empty_conditions_match_every_connection() {
        let manager = PolicyManager::new();
        manager
            .add_policy(policy("catch-all", vec![], PolicyAction::Alert))
            .await
            .unwrap();

        let matched = manager
            .get_matching_policy(&connection("1.2.3.4", 443, "TCP"))
            .await;
        assert_eq!(matched.unwrap().policy_id, "catch-all");
    }

    #[tokio::test]
    async fn conjunctive_conditions_require_all_fields() {
        let manager = PolicyManager::new();
        manager
            .add_policy(policy(
                "ssh-from-bad-ip",
                vec![ip_condition("10.0.0.1"), port_condition(22)],
                PolicyAction::Block,
            ))
            .await
            .unwrap();

        assert!(manager
            .get_matching_policy(&connection("10.0.0.1", 80, "TCP"))
            .await
            .is_none());
        assert!(manager
            .get_matching_policy(&connection("10.0.0.1", 22, "TCP"))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn earliest_inserted_matching_policy_wins() {
        let manager = PolicyManager::new();
        manager
            .add_policy(policy("first", vec![port_condition(80)], PolicyAction::Block))
            .await
            .unwrap();
        manager
            .add_policy(policy("second", vec![port_condition(80)], PolicyAction::Allow))
            .await
            .unwrap();

        let matched = manager
            .get_matching_policy(&connection("1.1.1.1", 80, "TCP"))
            .await
            .unwrap();
        assert_eq!(matched.policy_id, "first");
    }

    #[tokio::test]
    async fn clear_policies_resets_insertion_order() {
        let manager = PolicyManager::new();
        manager
            .add_policy(policy("p1", vec![], PolicyAction::Allow))
            .await
            .unwrap();
        manager.clear_policies().await;
        assert_eq!(manager.policy_count().await, 0);

        let added = manager
            .add_policy(policy("p2", vec![], PolicyAction::Allow))
            .await
            .unwrap();
        assert_eq!(added.insertion_order, 0);
    }
}
