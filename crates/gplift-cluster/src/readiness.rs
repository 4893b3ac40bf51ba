//! Waiting for a freshly started cluster to become ready.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

const FTS_PROBE: &str = "SELECT gp_request_fts_probe_scan();";

const STANDBY_STREAMING: &str = "SELECT COUNT(*) FROM gp_stat_replication \
     WHERE gp_segment_id = -1 AND state = 'streaming' AND sent_location = flush_location;";

fn segments_ready_query(has_mirrors: bool) -> String {
    let mut query = "SELECT COUNT(*) FROM gp_segment_configuration \
         WHERE content > -1 AND status = 'u' AND (role = preferred_role) "
        .to_string();
    if has_mirrors {
        query.push_str("AND mode = 's'");
    }
    query
}

/// Polls until every data-bearing segment is up in its preferred role (and
/// synchronized, when mirrored) and any standby is streaming, or until
/// `timeout` elapses.
pub async fn wait_for_segments(
    catalog: &dyn Catalog,
    timeout: Duration,
    cluster: &Cluster,
) -> ClusterResult<()> {
    let deadline = Instant::now() + timeout;
    let expected = cluster.excluding_coordinator_or_standby().len();
    info!(destination = %cluster.destination, expected, "waiting for segments");

    loop {
        if segments_ready(catalog, cluster, expected).await? {
            info!(destination = %cluster.destination, "segments ready");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ClusterError::Timeout(timeout));
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn segments_ready(
    catalog: &dyn Catalog,
    cluster: &Cluster,
    expected: usize,
) -> ClusterResult<bool> {
    let major = catalog.version().major;

    if major > 5 {
        catalog.execute(FTS_PROBE).await?;
    }

    let up = catalog
        .query_count(&segments_ready_query(cluster.has_mirrors()))
        .await?;
    debug!(up, expected, "segment readiness");
    if usize::try_from(up).ok() != Some(expected) {
        return Ok(false);
    }

    if major >= 6 && cluster.has_standby() {
        let streaming = catalog.query_count(STANDBY_STREAMING).await?;
        debug!(streaming, "standby readiness");
        return Ok(streaming == 1);
    }

    Ok(true)
}
