//! Detecting sessions that would block an upgrade.

use gplift_core::NextActionError;
use tracing::warn;

use crate::catalog::Catalog;
use crate::cluster::Cluster;
use crate::error::ClusterResult;

const ACTIVITY_QUERY: &str = "SELECT datname, usename, application_name, query \
     FROM pg_stat_activity WHERE pid <> pg_backend_pid();";

const ACTIVITY_QUERY_5X: &str = "SELECT datname, usename, application_name, current_query \
     FROM pg_stat_activity WHERE procpid <> pg_backend_pid();";

const CLOSE_CONNECTIONS: &str = "Please close all database connections before proceeding.";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Session {
    application: String,
    user: String,
    database: String,
    query: String,
}

/// Fails with a next-action error listing every other session connected to
/// the cluster.
pub async fn check_active_connections(catalog: &dyn Catalog, cluster: &Cluster) -> ClusterResult<()> {
    let query = if catalog.version().major < 6 {
        ACTIVITY_QUERY_5X
    } else {
        ACTIVITY_QUERY
    };

    let mut sessions = catalog
        .query(query)
        .await?
        .iter()
        .map(|row| {
            Ok(Session {
                database: row.text_or_empty(0)?.to_string(),
                user: row.text_or_empty(1)?.to_string(),
                application: row.text_or_empty(2)?.to_string(),
                query: row.text_or_empty(3)?.to_string(),
            })
        })
        .collect::<ClusterResult<Vec<_>>>()?;

    if sessions.is_empty() {
        return Ok(());
    }
    sessions.sort();
    warn!(destination = %cluster.destination, count = sessions.len(), "found active connections");

    let description = format!(
        "Found {} active connections to the {} cluster.\nMASTER_DATA_DIRECTORY={}\nPGPORT={}\n\n{}",
        sessions.len(),
        cluster.destination,
        cluster.coordinator_datadir().display(),
        cluster.coordinator_port(),
        render_table(&sessions),
    );
    Err(NextActionError::new(description, CLOSE_CONNECTIONS).into())
}

fn render_table(sessions: &[Session]) -> String {
    let header = ["Application:", "User:", "Database:", "Query:"];
    let rows: Vec<[&str; 4]> = sessions
        .iter()
        .map(|s| [s.application.as_str(), s.user.as_str(), s.database.as_str(), s.query.as_str()])
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    let line = |cells: [&str; 4]| {
        let mut out = String::new();
        for (cell, w) in cells.iter().zip(widths) {
            out.push_str(&format!("{cell:<width$}", width = w + 2));
        }
        out.trim_end().to_string()
    };

    let mut table = line(header);
    table.push('\n');
    for row in rows {
        table.push_str(&line(row));
        table.push('\n');
    }
    table
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;
    use crate::catalog::FakeCatalog;
    use crate::cluster::tests::mirrored_cluster;
    use crate::error::ClusterError;
    use crate::rows;

    #[tokio::test]
    async fn no_sessions_passes() {
        let cluster = mirrored_cluster(Version::new(6, 20, 0));
        let catalog = FakeCatalog::new(Version::new(6, 20, 0));
        check_active_connections(&catalog, &cluster).await.unwrap();
        assert_eq!(catalog.count("pid <> pg_backend_pid()"), 1);
    }

    #[tokio::test]
    async fn sessions_produce_sorted_table_and_next_action() {
        let cluster = mirrored_cluster(Version::new(6, 20, 0));
        let catalog = FakeCatalog::new(Version::new(6, 20, 0)).on(
            "pg_stat_activity",
            rows![
                ["postgres", "gpadmin", "psql", "select 1"],
                ["template1", "bob", "etl", "insert into t"],
            ],
        );

        let err = check_active_connections(&catalog, &cluster).await.unwrap_err();
        let ClusterError::NextAction(next) = err else {
            panic!("expected next action error, got {err:?}");
        };
        assert_eq!(
            next.to_string(),
            "Found 2 active connections to the source cluster.\n\
             MASTER_DATA_DIRECTORY=/data/qddir/seg-1\n\
             PGPORT=15432\n\n\
             Application:  User:    Database:  Query:\n\
             etl           bob      template1  insert into t\n\
             psql          gpadmin  postgres   select 1\n"
        );
        assert!(next.help().ends_with(CLOSE_CONNECTIONS));
    }

    #[tokio::test]
    async fn five_x_uses_procpid_columns() {
        let cluster = mirrored_cluster(Version::new(5, 29, 1));
        let catalog = FakeCatalog::new(Version::new(5, 29, 1));
        check_active_connections(&catalog, &cluster).await.unwrap();
        assert_eq!(catalog.count("current_query"), 1);
        assert_eq!(catalog.count("procpid <> pg_backend_pid()"), 1);
    }
}
