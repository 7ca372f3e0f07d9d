//! Cluster Router
//!
//! Picks the member that should handle a record for a given role.
//!
//! - **RoundRobin**: rotates over the role's endpoints
//! - **ConsistentHash**: the record's entity id is located on the role's
//!   hash ring, so one entity always lands on the same member while the
//!   membership is unchanged
//!
//! A pick equal to this process's own address comes back as
//! [`Endpoint::Local`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracehouse_core::Record;

use crate::error::{ClusterError, Result};
use crate::membership::{ClusterMembership, RemoteAddress};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    #[default]
    ConsistentHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local,
    Remote(RemoteAddress),
}

pub struct Router {
    membership: Arc<ClusterMembership>,
    strategy: RoutingStrategy,
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(membership: Arc<ClusterMembership>, strategy: RoutingStrategy) -> Self {
        Self {
            membership,
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    pub fn select_worker(&self, role: &str, record: &Record) -> Result<Endpoint> {
        let table = self.membership.snapshot();
        let members = table.role(role)?;
        if members.is_empty() {
            return Err(ClusterError::NoEndpoint(role.to_string()));
        }

        let index = match self.strategy {
            RoutingStrategy::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % members.len()
            }
            RoutingStrategy::ConsistentHash => members
                .ring()
                .locate(&record.id)
                .ok_or_else(|| ClusterError::NoEndpoint(role.to_string()))?,
        };

        let target = &members.endpoints()[index];
        if self.membership.is_self(target) {
            Ok(Endpoint::Local)
        } else {
            Ok(Endpoint::Remote(target.clone()))
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("strategy", &self.strategy)
            .field("membership", &self.membership)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tracehouse_core::Value;

    const ROLE: &str = "persistence";

    fn addr(port: u16) -> RemoteAddress {
        RemoteAddress::new("10.0.0.1", port)
    }

    fn record(id: &str) -> Record {
        Record::new(1, id, 202401010000, vec![Value::Long(1)])
    }

    fn membership(ports: &[u16]) -> Arc<ClusterMembership> {
        let membership = Arc::new(ClusterMembership::new(addr(1), 64));
        membership.declare_role(ROLE);
        for port in ports {
            membership.join(ROLE, addr(*port));
        }
        membership
    }

    #[test]
    fn test_consistent_hash_is_stable() {
        let router = Router::new(membership(&[1, 2, 3]), RoutingStrategy::ConsistentHash);

        for i in 0..200 {
            let r = record(&format!("service-{i}"));
            let first = router.select_worker(ROLE, &r).unwrap();
            for _ in 0..3 {
                assert_eq!(router.select_worker(ROLE, &r).unwrap(), first);
            }
        }
    }

    #[test]
    fn test_consistent_hash_ignores_other_fields() {
        let router = Router::new(membership(&[2, 3, 4]), RoutingStrategy::ConsistentHash);
        let a = Record::new(1, "svc", 1, vec![Value::Long(1)]);
        let b = Record::new(2, "svc", 2, vec![Value::Long(9)]);
        assert_eq!(
            router.select_worker(ROLE, &a).unwrap(),
            router.select_worker(ROLE, &b).unwrap()
        );
    }

    #[test]
    fn test_round_robin_cycles() {
        let router = Router::new(membership(&[1, 2, 3]), RoutingStrategy::RoundRobin);
        let r = record("svc");

        let picks: Vec<Endpoint> = (0..6).map(|_| router.select_worker(ROLE, &r).unwrap()).collect();
        assert_eq!(picks[0], Endpoint::Local);
        assert_eq!(picks[1], Endpoint::Remote(addr(2)));
        assert_eq!(picks[2], Endpoint::Remote(addr(3)));
        assert_eq!(&picks[..3], &picks[3..]);
    }

    #[test]
    fn test_self_is_local() {
        let router = Router::new(membership(&[1]), RoutingStrategy::ConsistentHash);
        assert_eq!(router.select_worker(ROLE, &record("a")).unwrap(), Endpoint::Local);
    }

    #[test]
    fn test_spreads_over_members() {
        let router = Router::new(membership(&[2, 3, 4]), RoutingStrategy::ConsistentHash);
        let picked: HashSet<String> = (0..300)
            .map(|i| match router.select_worker(ROLE, &record(&format!("svc-{i}"))).unwrap() {
                Endpoint::Local => "local".to_string(),
                Endpoint::Remote(a) => a.to_string(),
            })
            .collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_unknown_role_and_no_endpoint() {
        let router = Router::new(membership(&[]), RoutingStrategy::RoundRobin);
        let r = record("svc");

        assert!(matches!(
            router.select_worker("missing", &r),
            Err(ClusterError::UnknownRole(_))
        ));
        assert!(matches!(
            router.select_worker(ROLE, &r),
            Err(ClusterError::NoEndpoint(_))
        ));

        router.membership().join(ROLE, addr(5));
        assert_eq!(router.select_worker(ROLE, &r).unwrap(), Endpoint::Remote(addr(5)));
        router.membership().unreachable(&addr(5));
        assert!(matches!(
            router.select_worker(ROLE, &r),
            Err(ClusterError::NoEndpoint(_))
        ));
    }
}
