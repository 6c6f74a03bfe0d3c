//! Instance slots: port sets and resource names
//!
//! Everything here is a pure function of the instance id, so names and
//! ports can be recomputed even when the registry's bookkeeping is gone.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::paths::validate_name;
use crate::common::{Error, Result};

/// A port-owning service of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Db,
    Api,
    VectorStore,
    Tunnel,
}

impl PortKind {
    pub const ALL: [PortKind; 4] = [
        PortKind::Db,
        PortKind::Api,
        PortKind::VectorStore,
        PortKind::Tunnel,
    ];

    /// Port used by instance 0
    pub fn base(self) -> u16 {
        match self {
            PortKind::Db => 5438,
            PortKind::Api => 4002,
            PortKind::VectorStore => 19532,
            PortKind::Tunnel => 6100,
        }
    }
}

/// Ports reserved for one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSet {
    pub db: u16,
    pub api: u16,
    pub vector_store: u16,
    pub tunnel: u16,
}

impl PortSet {
    pub fn get(&self, kind: PortKind) -> u16 {
        match kind {
            PortKind::Db => self.db,
            PortKind::Api => self.api,
            PortKind::VectorStore => self.vector_store,
            PortKind::Tunnel => self.tunnel,
        }
    }
}

/// Check `id` against `[0, max_instances)`
pub fn check_instance_id(id: i64, max_instances: u32) -> Result<u32> {
    if id < 0 || id >= i64::from(max_instances) {
        return Err(Error::InstanceOutOfRange {
            id,
            max: max_instances,
        });
    }
    Ok(id as u32)
}

/// Ports for instance `id`: `base(kind) + id`
pub fn ports_for(id: i64, max_instances: u32) -> Result<PortSet> {
    let id = check_instance_id(id, max_instances)?;
    let port = |kind: PortKind| -> Result<u16> {
        u16::try_from(u32::from(kind.base()) + id).map_err(|_| Error::InstanceOutOfRange {
            id: i64::from(id),
            max: max_instances,
        })
    };
    Ok(PortSet {
        db: port(PortKind::Db)?,
        api: port(PortKind::Api)?,
        vector_store: port(PortKind::VectorStore)?,
        tunnel: port(PortKind::Tunnel)?,
    })
}

/// Kind of OS-level resource an instance owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Database container
    Db,
    /// API server session
    Api,
    /// Vector store container
    Vector,
    /// Tunnel session
    Tunnel,
    /// Compose project
    Stack,
    /// Local state directory
    Data,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Db => "db",
            ResourceKind::Api => "api",
            ResourceKind::Vector => "vector",
            ResourceKind::Tunnel => "tunnel",
            ResourceKind::Stack => "stack",
            ResourceKind::Data => "data",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{prefix}-{id}-{kind}`, validated for use in an argument vector
pub fn resource_name(prefix: &str, id: u32, kind: ResourceKind) -> Result<String> {
    let name = format!("{}-{}-{}", prefix, id, kind);
    validate_name(&name)?;
    Ok(name)
}

/// Name prefix shared by every resource of one instance
pub fn instance_prefix(prefix: &str, id: u32) -> Result<String> {
    validate_name(prefix)?;
    Ok(format!("{}-{}-", prefix, id))
}

/// Persisted bookkeeping for one acquired instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: u32,
    pub ports: PortSet,
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ports_are_base_plus_id() {
        let p0 = ports_for(0, 5).unwrap();
        assert_eq!(
            p0,
            PortSet {
                db: 5438,
                api: 4002,
                vector_store: 19532,
                tunnel: 6100
            }
        );

        let p5 = ports_for(5, 10).unwrap();
        assert_eq!(
            p5,
            PortSet {
                db: 5443,
                api: 4007,
                vector_store: 19537,
                tunnel: 6105
            }
        );
        assert_eq!(p5.get(PortKind::Tunnel), 6105);
    }

    #[test]
    fn test_ports_pairwise_distinct() {
        let max = 10;
        let mut seen = HashSet::new();
        for id in 0..max {
            let ports = ports_for(i64::from(id), max).unwrap();
            for kind in PortKind::ALL {
                assert_eq!(ports.get(kind), kind.base() + id as u16);
                assert!(seen.insert(ports.get(kind)));
            }
        }
    }

    #[test]
    fn test_out_of_range() {
        assert!(matches!(
            ports_for(-1, 5),
            Err(Error::InstanceOutOfRange { id: -1, max: 5 })
        ));
        assert!(matches!(
            ports_for(5, 5),
            Err(Error::InstanceOutOfRange { id: 5, max: 5 })
        ));
        assert!(ports_for(4, 5).is_ok());
    }

    #[test]
    fn test_resource_names() {
        assert_eq!(
            resource_name("agent-eval", 2, ResourceKind::Db).unwrap(),
            "agent-eval-2-db"
        );
        assert_eq!(instance_prefix("agent-eval", 3).unwrap(), "agent-eval-3-");
        assert!(resource_name("bad prefix", 0, ResourceKind::Api).is_err());
        assert!(instance_prefix("../x", 0).is_err());
    }
}
