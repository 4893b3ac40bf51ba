//! A single database instance in the cluster.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Content id of the coordinator and its standby.
pub const COORDINATOR_CONTENT: i32 = -1;

/// Dbid of the coordinator primary.
pub const COORDINATOR_DBID: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Mirror,
}

impl Role {
    /// Parses the single-letter role stored in `gp_segment_configuration`.
    pub fn from_catalog(role: &str) -> Option<Role> {
        match role {
            "p" => Some(Role::Primary),
            "m" => Some(Role::Mirror),
            _ => None,
        }
    }

    pub fn as_catalog(self) -> &'static str {
        match self {
            Role::Primary => "p",
            Role::Mirror => "m",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub dbid: i32,
    pub content_id: i32,
    pub port: u16,
    pub hostname: String,
    pub datadir: PathBuf,
    pub role: Role,
}

impl Segment {
    pub fn is_coordinator(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT && self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.content_id == COORDINATOR_CONTENT && self.role == Role::Mirror
    }

    /// A data-bearing primary (content ≥ 0).
    pub fn is_primary(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT && self.role == Role::Primary
    }

    /// A data-bearing mirror (content ≥ 0).
    pub fn is_mirror(&self) -> bool {
        self.content_id != COORDINATOR_CONTENT && self.role == Role::Mirror
    }

    /// Builds a segment from a configuration row:
    /// `dbid, contentid, port, hostname, datadir, role`.
    pub(crate) fn from_row(row: &crate::catalog::Row) -> ClusterResult<Segment> {
        let role_text = row.text(5)?;
        let segment = Segment {
            dbid: row.parse(0)?,
            content_id: row.parse(1)?,
            port: row.parse(2)?,
            hostname: row.text(3)?.to_string(),
            datadir: PathBuf::from(row.text(4)?),
            role: Role::Primary,
        };

        match Role::from_catalog(role_text) {
            Some(role) => Ok(Segment { role, ..segment }),
            None => Err(ClusterError::InvalidSegment {
                segment: segment.to_string(),
                reason: format!("unknown role {role_text:?}"),
            }),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dbid={} content={} role={} host={} port={} datadir={}",
            self.dbid,
            self.content_id,
            self.role.as_catalog(),
            self.hostname,
            self.port,
            self.datadir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Row;

    #[test]
    fn predicates_split_coordinator_pair_from_segments() {
        let mut seg = Segment {
            dbid: 1,
            content_id: -1,
            port: 5432,
            hostname: "cdw".into(),
            datadir: "/data/qddir/seg-1".into(),
            role: Role::Primary,
        };
        assert!(seg.is_coordinator());
        assert!(!seg.is_primary());

        seg.role = Role::Mirror;
        assert!(seg.is_standby());
        assert!(!seg.is_mirror());

        seg.content_id = 3;
        assert!(seg.is_mirror());
    }

    #[test]
    fn from_row_rejects_unknown_role() {
        let row: Row = ["2", "0", "25432", "sdw1", "/data/p0", "x"].into_iter().collect();
        let err = Segment::from_row(&row).unwrap_err();
        assert!(err.to_string().contains("unknown role \"x\""), "{err}");
    }
}
