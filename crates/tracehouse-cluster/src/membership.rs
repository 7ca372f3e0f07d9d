//! Cluster Membership
//!
//! The role → endpoint table every router reads. Updates (`join`, `quit`,
//! `unreachable`) build a new table and swap it in; readers hold an
//! `Arc` snapshot and never see a half-applied change.
//!
//! Discovery itself is external: whatever learns about peers calls these
//! methods.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracehouse_observability::metrics;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::ring::HashRing;

/// `host:port` of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteAddress {
    host: String,
    port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RemoteAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ClusterError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ClusterError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for RemoteAddress {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RemoteAddress> for String {
    fn from(addr: RemoteAddress) -> Self {
        addr.to_string()
    }
}

/// Endpoints of one role, sorted, with their hash ring
#[derive(Debug, Clone, Default)]
pub struct RoleMembers {
    endpoints: Vec<RemoteAddress>,
    ring: HashRing,
}

impl RoleMembers {
    fn new(mut endpoints: Vec<RemoteAddress>, virtual_nodes: usize) -> Self {
        endpoints.sort();
        endpoints.dedup();
        let ring = HashRing::build(&endpoints, virtual_nodes);
        Self { endpoints, ring }
    }

    pub fn endpoints(&self) -> &[RemoteAddress] {
        &self.endpoints
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Immutable view of the membership at one point in time
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    roles: HashMap<String, RoleMembers>,
}

impl MembershipTable {
    /// Members of `role`; an undeclared role is a configuration error.
    pub fn role(&self, role: &str) -> Result<&RoleMembers> {
        self.roles
            .get(role)
            .ok_or_else(|| ClusterError::UnknownRole(role.to_string()))
    }

    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }
}

pub struct ClusterMembership {
    self_address: RemoteAddress,
    virtual_nodes: usize,
    table: RwLock<Arc<MembershipTable>>,
}

impl ClusterMembership {
    pub fn new(self_address: RemoteAddress, virtual_nodes: usize) -> Self {
        Self {
            self_address,
            virtual_nodes,
            table: RwLock::new(Arc::new(MembershipTable::default())),
        }
    }

    pub fn self_address(&self) -> &RemoteAddress {
        &self.self_address
    }

    pub fn is_self(&self, addr: &RemoteAddress) -> bool {
        *addr == self.self_address
    }

    pub fn snapshot(&self) -> Arc<MembershipTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Make `role` known, with no endpoints yet.
    pub fn declare_role(&self, role: &str) {
        self.update(|roles, _| {
            if roles.contains_key(role) {
                return Vec::new();
            }
            roles.insert(role.to_string(), RoleMembers::default());
            vec![role.to_string()]
        });
    }

    /// Add `addr` to `role`. Returns false when it was already a member.
    pub fn join(&self, role: &str, addr: RemoteAddress) -> bool {
        let changed = self.update(|roles, vnodes| {
            let current = roles.get(role).map(|m| m.endpoints.clone()).unwrap_or_default();
            if current.contains(&addr) {
                return Vec::new();
            }
            let mut endpoints = current;
            endpoints.push(addr.clone());
            roles.insert(role.to_string(), RoleMembers::new(endpoints, vnodes));
            vec![role.to_string()]
        });
        if changed {
            info!(role, endpoint = %addr, "Member joined");
        }
        changed
    }

    /// Remove `addr` from `role`. The role itself stays declared.
    pub fn quit(&self, role: &str, addr: &RemoteAddress) -> bool {
        let changed = self.update(|roles, vnodes| match roles.get(role) {
            Some(members) if members.endpoints.contains(addr) => {
                let endpoints = members
                    .endpoints
                    .iter()
                    .filter(|e| *e != addr)
                    .cloned()
                    .collect();
                roles.insert(role.to_string(), RoleMembers::new(endpoints, vnodes));
                vec![role.to_string()]
            }
            _ => Vec::new(),
        });
        if changed {
            info!(role, endpoint = %addr, "Member quit");
        }
        changed
    }

    /// Drop `addr` from every role. Returns the number of roles it left.
    pub fn unreachable(&self, addr: &RemoteAddress) -> usize {
        let mut affected = 0;
        self.update(|roles, vnodes| {
            let mut changed = Vec::new();
            for (role, members) in roles.iter_mut() {
                if members.endpoints.contains(addr) {
                    let endpoints = members
                        .endpoints
                        .iter()
                        .filter(|e| *e != addr)
                        .cloned()
                        .collect();
                    *members = RoleMembers::new(endpoints, vnodes);
                    changed.push(role.clone());
                }
            }
            affected = changed.len();
            changed
        });
        if affected > 0 {
            info!(endpoint = %addr, roles = affected, "Member unreachable");
        }
        affected
    }

    /// Copy the table, apply `f`, and swap the copy in if `f` reports any
    /// changed roles.
    fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut HashMap<String, RoleMembers>, usize) -> Vec<String>,
    {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut roles = guard.roles.clone();
        let changed = f(&mut roles, self.virtual_nodes);
        if changed.is_empty() {
            return false;
        }

        for role in &changed {
            let count = roles.get(role).map(RoleMembers::len).unwrap_or_default();
            metrics::CLUSTER_MEMBERS
                .with_label_values(&[role.as_str()])
                .set(count as i64);
            debug!(role = %role, endpoints = count, "Membership updated");
        }
        *guard = Arc::new(MembershipTable { roles });
        true
    }
}

impl fmt::Debug for ClusterMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterMembership")
            .field("self_address", &self.self_address)
            .field("roles", &self.snapshot().roles())
            .finish()
    }
}
