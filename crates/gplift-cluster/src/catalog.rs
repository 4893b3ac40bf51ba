//! Narrow query interface to a cluster's system catalog.
//!
//! Queries are run with the simple query protocol so every column comes back
//! as text; callers parse what they need from [`Row`].

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use semver::Version;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::connection::ConnectionConfig;
use crate::error::{ClusterError, ClusterResult};

/// One result row, every column as optional text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    columns: Vec<Option<String>>,
}

impl Row {
    pub fn new(columns: Vec<Option<String>>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Text of a non-null column.
    pub fn text(&self, column: usize) -> ClusterResult<&str> {
        match self.columns.get(column) {
            Some(Some(value)) => Ok(value),
            Some(None) => Err(ClusterError::Row {
                column,
                reason: "unexpected NULL".into(),
            }),
            None => Err(ClusterError::Row {
                column,
                reason: format!("row has only {} columns", self.columns.len()),
            }),
        }
    }

    /// Text of a column, with NULL read as the empty string.
    pub fn text_or_empty(&self, column: usize) -> ClusterResult<&str> {
        match self.columns.get(column) {
            Some(value) => Ok(value.as_deref().unwrap_or_default()),
            None => self.text(column),
        }
    }

    pub fn parse<T>(&self, column: usize) -> ClusterResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let text = self.text(column)?;
        text.trim().parse().map_err(|err: T::Err| ClusterError::Row {
            column,
            reason: format!("{text:?}: {err}"),
        })
    }
}

impl<S: Into<String>> FromIterator<S> for Row {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Row::new(iter.into_iter().map(|s| Some(s.into())).collect())
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Server version the connection was opened for; query shapes depend on it.
    fn version(&self) -> &Version;

    /// Runs a statement and discards any result set.
    async fn execute(&self, sql: &str) -> ClusterResult<()>;

    async fn query(&self, sql: &str) -> ClusterResult<Vec<Row>>;

    /// Runs a query expected to return exactly one integer, such as `COUNT(*)`.
    async fn query_count(&self, sql: &str) -> ClusterResult<i64> {
        let rows = self.query(sql).await?;
        match rows.as_slice() {
            [row] => row.parse(0),
            _ => Err(ClusterError::Query(format!(
                "expected one row from {sql:?}, got {}",
                rows.len()
            ))),
        }
    }
}

// ── tokio-postgres ─────────────────────────────────────────────────

/// A live catalog connection.
pub struct PgCatalog {
    client: tokio_postgres::Client,
    version: Version,
}

impl PgCatalog {
    pub async fn connect(config: &ConnectionConfig) -> ClusterResult<Self> {
        let pg_config = config.to_pg_config();
        debug!(uri = %config.uri(), "connecting to catalog");

        let (client, connection) = pg_config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!("catalog connection failed: {err}");
            }
        });

        Ok(Self {
            client,
            version: config.version.clone(),
        })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    fn version(&self) -> &Version {
        &self.version
    }

    async fn execute(&self, sql: &str) -> ClusterResult<()> {
        self.client.simple_query(sql).await?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> ClusterResult<Vec<Row>> {
        let messages = self.client.simple_query(sql).await?;
        let rows = messages
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(Row::new(
                    (0..row.len()).map(|i| row.get(i).map(str::to_owned)).collect(),
                )),
                _ => None,
            })
            .collect();
        Ok(rows)
    }
}

// ── Fake ───────────────────────────────────────────────────────────

enum Reply {
    Rows(Vec<Row>),
    Fail(String),
}

/// Scripted catalog for tests.
///
/// Replies are registered against a substring of the SQL. Each registered
/// pattern holds a queue; the last reply in a queue repeats forever.
pub struct FakeCatalog {
    version: Version,
    replies: Mutex<Vec<(String, VecDeque<Reply>)>>,
    statements: Mutex<Vec<String>>,
}

impl FakeCatalog {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            replies: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
        }
    }

    /// Appends a reply for SQL containing `pattern`.
    pub fn on(self, pattern: &str, rows: Vec<Row>) -> Self {
        self.push(pattern, Reply::Rows(rows));
        self
    }

    pub fn on_error(self, pattern: &str, message: &str) -> Self {
        self.push(pattern, Reply::Fail(message.to_string()));
        self
    }

    /// Every statement run so far.
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// How many statements contained `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }

    fn push(&self, pattern: &str, reply: Reply) {
        if let Ok(mut replies) = self.replies.lock() {
            match replies.iter_mut().find(|(p, _)| p == pattern) {
                Some((_, queue)) => queue.push_back(reply),
                None => replies.push((pattern.to_string(), VecDeque::from([reply]))),
            }
        }
    }

    fn answer(&self, sql: &str) -> ClusterResult<Vec<Row>> {
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(sql.to_string());
        }

        let mut replies = self
            .replies
            .lock()
            .map_err(|_| ClusterError::Query("fake catalog poisoned".into()))?;
        let Some((_, queue)) = replies.iter_mut().find(|(p, _)| sql.contains(p.as_str())) else {
            return Ok(Vec::new());
        };

        let reply = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().map(|r| match r {
                Reply::Rows(rows) => Reply::Rows(rows.clone()),
                Reply::Fail(msg) => Reply::Fail(msg.clone()),
            })
        };

        match reply {
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Fail(msg)) => Err(ClusterError::Query(msg)),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Catalog for FakeCatalog {
    fn version(&self) -> &Version {
        &self.version
    }

    async fn execute(&self, sql: &str) -> ClusterResult<()> {
        self.answer(sql).map(|_| ())
    }

    async fn query(&self, sql: &str) -> ClusterResult<Vec<Row>> {
        self.answer(sql)
    }
}

/// Shorthand for building fake rows: `rows![["1", "-1"], ["2", "0"]]`.
#[macro_export]
macro_rules! rows {
    ($([$($col:expr),* $(,)?]),* $(,)?) => {
        vec![$($crate::catalog::Row::from_iter([$($col),*])),*]
    };
}
