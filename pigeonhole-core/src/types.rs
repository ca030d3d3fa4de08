//! Core data model: networks, pools, bindings, and reservations.
//!
//! These records are what the registry persists; every one of them is stored
//! as JSON under the registry key prefix. Relations between them are held as
//! ids, never as object references, and managers materialize views on demand.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Free-form user metadata carried by networks, pools, bindings, and
/// reservations.
pub type Annotations = HashMap<String, String>;

/// Merge pool/binding annotations over a base set; values from `overrides`
/// win.
pub fn merge_annotations(base: &Annotations, overrides: &Annotations) -> Annotations {
    let mut merged = base.clone();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Nanoseconds since the Unix epoch; the resolution all binding timestamps
/// use. Zero means "never happened".
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// One CIDR-scoped namespace of addresses under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    /// Id of the allocator that owns this network's address space.
    pub ipam: String,
    pub cidr: String,
    #[serde(default)]
    pub annotations: Annotations,
}

/// Composite pool identifier; pools are namespaced by their network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolId {
    pub network_id: String,
    pub id: String,
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network_id, self.id)
    }
}

/// Allocation policy of a pool.
///
/// FIXED pools only ever re-bind addresses that were explicitly allocated
/// into them; DYNAMIC pools may claim fresh addresses during a bind, up to
/// their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolType {
    #[serde(rename = "FIXED")]
    Fixed,
    #[serde(rename = "DYNAMIC")]
    Dynamic,
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolType::Fixed => write!(f, "FIXED"),
            PoolType::Dynamic => write!(f, "DYNAMIC"),
        }
    }
}

/// A policy-bearing subset of a network's addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    #[serde(rename = "type")]
    pub pool_type: PoolType,
    /// Upper bound on the number of bindings in the pool; 0 means unbounded.
    pub maximum: u64,
    #[serde(default)]
    pub annotations: Annotations,
}

/// Lifecycle state of a binding, derived from its three timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Allocated,
    Bound,
    Released,
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::Allocated => write!(f, "ALLOCATED"),
            BindingState::Bound => write!(f, "BOUND"),
            BindingState::Released => write!(f, "RELEASED"),
        }
    }
}

/// A record of one address's reservation by an external consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: String,
    pub pool_id: PoolId,
    pub address: String,
    #[serde(default)]
    pub allocate_time: i64,
    #[serde(default)]
    pub bind_time: i64,
    #[serde(default)]
    pub release_time: i64,
    #[serde(default)]
    pub annotations: Annotations,
}

impl Binding {
    /// State is never stored; it is always derived from the timestamps.
    pub fn state(&self) -> BindingState {
        if self.bind_time > 0 && self.release_time <= self.bind_time {
            BindingState::Bound
        } else if self.bind_time > 0 && self.release_time > self.bind_time {
            BindingState::Released
        } else {
            BindingState::Allocated
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state() == BindingState::Bound
    }
}

/// A CIDR the allocator must never hand out, regardless of pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub network_id: String,
    pub cidr: String,
    #[serde(default)]
    pub annotations: Annotations,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(allocate: i64, bind: i64, release: i64) -> Binding {
        Binding {
            id: "b1".into(),
            pool_id: PoolId {
                network_id: "n1".into(),
                id: "p1".into(),
            },
            address: "10.0.0.1".into(),
            allocate_time: allocate,
            bind_time: bind,
            release_time: release,
            annotations: Annotations::new(),
        }
    }

    #[test]
    fn binding_state_derivation() {
        assert_eq!(binding(100, 0, 0).state(), BindingState::Allocated);
        assert_eq!(binding(100, 200, 0).state(), BindingState::Bound);
        // A rebind after release flips the binding back to bound.
        assert_eq!(binding(100, 400, 300).state(), BindingState::Bound);
        assert_eq!(binding(100, 200, 300).state(), BindingState::Released);
    }

    #[test]
    fn annotations_merge_overrides_win() {
        let mut base = Annotations::new();
        base.insert("env".into(), "prod".into());
        base.insert("team".into(), "net".into());
        let mut overlay = Annotations::new();
        overlay.insert("env".into(), "lab".into());

        let merged = merge_annotations(&base, &overlay);
        assert_eq!(merged.get("env").map(String::as_str), Some("lab"));
        assert_eq!(merged.get("team").map(String::as_str), Some("net"));
    }

    #[test]
    fn pool_type_round_trips_as_upper_case() {
        let json = serde_json::to_string(&PoolType::Dynamic).unwrap();
        assert_eq!(json, "\"DYNAMIC\"");
        let back: PoolType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PoolType::Dynamic);
    }
}
