//! Tablespace catalog and the mapping file handed to `pg_upgrade`.
//!
//! The mapping file is headerless CSV, one row per (segment, tablespace):
//! `dbid,oid,name,location,userdefined`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::Catalog;
use crate::error::{ClusterError, ClusterResult};
use crate::segment::COORDINATOR_DBID;

/// File name of the mapping file inside the state directory.
pub const TABLESPACES_MAPPING_FILE: &str = "tablespaces.txt";

const TABLESPACES_QUERY_5X: &str = "
	SELECT
		fsedbid as dbid,
		upgrade_tablespace.oid as oid,
		spcname as name,
		case when is_user_defined_tablespace then location_with_oid else fselocation end as location,
		(is_user_defined_tablespace::int) as userdefined
	FROM (
			SELECT
				pg_tablespace.oid,
				*,
				(fselocation || '/' || pg_tablespace.oid) as location_with_oid,
				(spcname not in ('pg_default', 'pg_global'))  as is_user_defined_tablespace
			FROM pg_tablespace
			INNER JOIN pg_filespace_entry
			ON fsefsoid = spcfsoid
		) upgrade_tablespace";

const TABLESPACES_QUERY: &str = "
	SELECT
		c.dbid,
		t.oid,
		t.spcname as name,
		case when t.spcname in ('pg_default', 'pg_global') then c.datadir
			else regexp_replace(l.tblspc_loc, '/' || c.dbid || '$', '') end as location,
		(t.spcname not in ('pg_default', 'pg_global'))::int as userdefined
	FROM pg_tablespace t
	JOIN gp_segment_configuration c ON c.role = 'p'
	LEFT JOIN LATERAL gp_tablespace_location(t.oid) l ON l.gp_segment_id = c.content
	ORDER BY c.dbid, t.oid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablespaceInfo {
    pub location: PathBuf,
    pub user_defined: bool,
}

/// One row of the tablespace catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablespaceTuple {
    pub dbid: i32,
    pub oid: u32,
    pub name: String,
    pub location: PathBuf,
    pub user_defined: bool,
}

/// Tablespaces per segment: `dbid → oid → info`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tablespaces(pub BTreeMap<i32, BTreeMap<u32, TablespaceInfo>>);

impl Tablespaces {
    pub fn from_tuples(tuples: &[TablespaceTuple]) -> Self {
        let mut map: BTreeMap<i32, BTreeMap<u32, TablespaceInfo>> = BTreeMap::new();
        for t in tuples {
            map.entry(t.dbid).or_default().insert(
                t.oid,
                TablespaceInfo {
                    location: t.location.clone(),
                    user_defined: t.user_defined,
                },
            );
        }
        Tablespaces(map)
    }

    pub fn for_dbid(&self, dbid: i32) -> Option<&BTreeMap<u32, TablespaceInfo>> {
        self.0.get(&dbid)
    }

    pub fn coordinator_tablespaces(&self) -> Option<&BTreeMap<u32, TablespaceInfo>> {
        self.for_dbid(COORDINATOR_DBID)
    }

    /// User-defined tablespaces of one segment; `pg_default` and `pg_global`
    /// never need directory handling.
    pub fn user_defined(&self, dbid: i32) -> impl Iterator<Item = (u32, &TablespaceInfo)> {
        self.for_dbid(dbid)
            .into_iter()
            .flat_map(|m| m.iter())
            .filter(|(_, info)| info.user_defined)
            .map(|(oid, info)| (*oid, info))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Location of a tablespace for one segment: `<location>/<dbid>`.
pub fn location_for_dbid(info: &TablespaceInfo, dbid: i32) -> PathBuf {
    info.location.join(dbid.to_string())
}

/// Where the upgraded coordinator's copy of a tablespace lives under `base`.
pub fn coordinator_tablespace_location(base: &Path, oid: u32) -> PathBuf {
    base.join(oid.to_string()).join(COORDINATOR_DBID.to_string())
}

// ── Catalog ────────────────────────────────────────────────────────

pub async fn query_tablespaces(catalog: &dyn Catalog) -> ClusterResult<Vec<TablespaceTuple>> {
    let query = if catalog.version().major < 6 {
        TABLESPACES_QUERY_5X
    } else {
        TABLESPACES_QUERY
    };

    catalog
        .query(query)
        .await?
        .iter()
        .map(|row| {
            Ok(TablespaceTuple {
                dbid: row.parse(0)?,
                oid: row.parse(1)?,
                name: row.text(2)?.to_string(),
                location: PathBuf::from(row.text_or_empty(3)?),
                user_defined: row.parse::<i32>(4)? == 1,
            })
        })
        .collect()
}

/// Queries the tablespace catalog, writes the mapping file, and returns the
/// in-memory form.
pub async fn tablespaces_from_db(
    catalog: &dyn Catalog,
    mapping_file: &Path,
) -> ClusterResult<Tablespaces> {
    let tuples = query_tablespaces(catalog).await?;

    let file = File::create(mapping_file)?;
    write_tuples(file, &tuples)?;
    info!(path = %mapping_file.display(), rows = tuples.len(), "wrote tablespace mapping file");

    Ok(Tablespaces::from_tuples(&tuples))
}

// ── CSV ────────────────────────────────────────────────────────────

pub fn write_tuples<W: Write>(writer: W, tuples: &[TablespaceTuple]) -> ClusterResult<()> {
    let mut csv = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    for t in tuples {
        csv.write_record([
            t.dbid.to_string(),
            t.oid.to_string(),
            t.name.clone(),
            t.location.to_string_lossy().into_owned(),
            if t.user_defined { "1" } else { "0" }.to_string(),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

pub fn read_tuples<R: Read>(reader: R) -> ClusterResult<Vec<TablespaceTuple>> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(reader);

    csv.records()
        .map(|record| {
            let record = record?;
            let field = |i: usize| {
                record.get(i).ok_or_else(|| ClusterError::Row {
                    column: i,
                    reason: "missing field in tablespace mapping file".into(),
                })
            };
            let int = |i: usize| -> ClusterResult<i64> {
                let text = field(i)?;
                text.parse().map_err(|_| ClusterError::Row {
                    column: i,
                    reason: format!("{text:?} is not an integer"),
                })
            };
            let narrow = |i: usize, value: i64| -> ClusterResult<i32> {
                i32::try_from(value).map_err(|_| ClusterError::Row {
                    column: i,
                    reason: format!("{value} out of range"),
                })
            };

            Ok(TablespaceTuple {
                dbid: narrow(0, int(0)?)?,
                oid: u32::try_from(int(1)?).map_err(|_| ClusterError::Row {
                    column: 1,
                    reason: "oid out of range".into(),
                })?,
                name: field(2)?.to_string(),
                location: PathBuf::from(field(3)?),
                user_defined: int(4)? == 1,
            })
        })
        .collect()
}
