//! Perfdata label lookup against the monitoring database.
//!
//! Sidecar files only know generic datasource names, the database holds the
//! labels the monitoring system currently reports for each service uuid.
//! Everything is fetched in one bulk query up front, optionally persisted to
//! a json cache file so later runs can work without database access.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sqlx::Connection;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Service uuid to raw perfdata string, the result of one bulk prefetch.
pub type PerfdataMap = HashMap<String, String>;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Latest perfdata string per service in the classic ndoutils schema.
/// Service uuids live in nagios_objects.name2.
const V3_PERFDATA_QUERY: &str = "SELECT nagios_objects.name2, nagios_servicechecks.perfdata, \
     MAX(nagios_servicechecks.start_time) AS start_time \
     FROM nagios_objects \
     INNER JOIN nagios_servicechecks \
     ON nagios_servicechecks.service_object_id = nagios_objects.object_id \
     WHERE nagios_servicechecks.perfdata IS NOT NULL \
     GROUP BY nagios_objects.object_id, nagios_objects.name2";

/// Same lookup against the statusengine schema, where servicechecks carry
/// the uuid directly.
const V4_PERFDATA_QUERY: &str = "SELECT service_description, perfdata, \
     MAX(start_time) AS start_time \
     FROM statusengine_servicechecks \
     WHERE perfdata IS NOT NULL \
     GROUP BY service_description";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("could not read database credentials {path}: {source}")]
    CredentialsRead { path: PathBuf, source: io::Error },
    #[error("could not parse database credentials {path}: {source}")]
    CredentialsParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("could not read perfdata cache {path}: {source}")]
    CacheRead { path: PathBuf, source: io::Error },
    #[error("could not parse perfdata cache {path}: {source}")]
    CacheParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("could not write perfdata cache {path}: {source}")]
    CacheWrite { path: PathBuf, source: io::Error },
}

/// Which database schema generation to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V3,
    V4,
}

impl SchemaVersion {
    pub fn from_flag(version: u8) -> Option<Self> {
        match version {
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            _ => None,
        }
    }

    fn query(self) -> &'static str {
        match self {
            Self::V3 => V3_PERFDATA_QUERY,
            Self::V4 => V4_PERFDATA_QUERY,
        }
    }
}

/// Connection credentials, read from a toml file with a `[client]` table.
#[derive(Debug, Deserialize)]
pub struct DbCredentials {
    client: ClientSection,
}

#[derive(Debug, Deserialize)]
struct ClientSection {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    user: String,
    password: String,
    database: String,
}

fn default_port() -> u16 {
    3306
}

impl DbCredentials {
    pub fn load(path: &Path) -> Result<Self, LookupError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LookupError::CredentialsRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| LookupError::CredentialsParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        MySqlConnectOptions::new()
            .host(&self.client.host)
            .port(self.client.port)
            .username(&self.client.user)
            .password(&self.client.password)
            .database(&self.client.database)
    }
}

pub struct LookupService {
    pool: MySqlPool,
    retry: u32,
}

impl LookupService {
    /// Connects and pings the server. A DSN overrides the credentials file.
    #[instrument(skip_all, fields(repo = "lookup", operation = "connect"))]
    pub async fn connect(
        dsn: Option<&str>,
        credentials_path: &Path,
        retry: u32,
    ) -> Result<Self, LookupError> {
        let options = match dsn {
            Some(url) => url.parse::<MySqlConnectOptions>()?,
            None => DbCredentials::load(credentials_path)?.connect_options(),
        };
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        pool.acquire().await?.ping().await?;
        Ok(Self { pool, retry })
    }

    /// Fetches the uuid to perfdata map in one query. Failures are retried
    /// with a fixed delay up to the configured attempt count; running out of
    /// attempts is fatal to the whole run.
    #[instrument(skip(self), fields(repo = "lookup", operation = "fetch_perfdata"))]
    pub async fn fetch_perfdata(&self, schema: SchemaVersion) -> Result<PerfdataMap, LookupError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.query_perfdata(schema).await {
                Ok(map) => {
                    info!(services = map.len(), "fetched perfdata mappings");
                    return Ok(map);
                }
                Err(err) if attempt < self.retry => {
                    warn!(error = %err, attempt, "lost connection to mysql server, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn query_perfdata(&self, schema: SchemaVersion) -> Result<PerfdataMap, sqlx::Error> {
        let rows = sqlx::query(schema.query()).fetch_all(&self.pool).await?;
        let mut map = PerfdataMap::with_capacity(rows.len());
        for row in rows {
            let uuid: String = row.try_get(0)?;
            let perfdata: Option<String> = row.try_get(1)?;
            if let Some(perfdata) = perfdata {
                map.insert(uuid, perfdata);
            }
        }
        Ok(map)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Loads a previously stored prefetch result.
pub fn load_cache(path: &Path) -> Result<PerfdataMap, LookupError> {
    let raw = std::fs::read(path).map_err(|source| LookupError::CacheRead {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| LookupError::CacheParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Persists a prefetch result for later `--no-sql` runs.
pub fn store_cache(path: &Path, map: &PerfdataMap) -> Result<(), LookupError> {
    let data = serde_json::to_vec(map).map_err(|source| LookupError::CacheParse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, data).map_err(|source| LookupError::CacheWrite {
        path: path.to_path_buf(),
        source,
    })
}
