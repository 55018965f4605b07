//! Storage configuration and stack assembly.

use std::{path::PathBuf, time::Duration};

use kestrel_common::LogName;
use serde::Deserialize;

use crate::{
    engines::{BigMemoryStore, BodyStore, Complex, MemoryStore, SqliteMetaStore, Throttle},
    error::{Result, StorageError},
    storage::Storage,
};

const fn default_timeout() -> u64 {
    4
}

const fn default_throttle_max() -> usize {
    2
}

/// The pluggable front tier.
///
/// `Small` scans a single map per claim and is right for the default
/// deployment, where the front holds only the last few seconds of traffic.
/// `Big` keeps secondary indexes and pays off when the drain timeout is long
/// or the front is used standalone.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(tag = "type")]
pub enum FrontStoreConfig {
    #[default]
    Small,
    Big,
}

impl FrontStoreConfig {
    fn into_front(self, name: LogName) -> Box<dyn Storage> {
        match self {
            Self::Small => Box::new(MemoryStore::new().named(name)),
            Self::Big => Box::new(BigMemoryStore::new().named(name)),
        }
    }
}

/// Configuration for the storage subsystem.
///
/// `data_dir` is the only required field; everything else has the stock
/// deployment's defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of persistent state: the database and the body files.
    pub data_dir: PathBuf,

    /// Front-to-back drain delay in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum concurrent back-store stores.
    #[serde(default = "default_throttle_max")]
    pub throttle_max: usize,

    /// Front tier flavor.
    #[serde(default)]
    pub front_store: FrontStoreConfig,

    /// Metadata store connection. Defaults to SQLite at `<data_dir>/mq.db`;
    /// only the `sqlite:` scheme is supported.
    #[serde(default)]
    pub db_dsn: Option<String>,

    /// Accepted for configuration compatibility; unused by SQLite.
    #[serde(default)]
    pub db_username: Option<String>,

    /// Accepted for configuration compatibility; unused by SQLite.
    #[serde(default)]
    pub db_password: Option<String>,
}

impl StorageConfig {
    /// Configuration with stock defaults for `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            timeout: default_timeout(),
            throttle_max: default_throttle_max(),
            front_store: FrontStoreConfig::default(),
            db_dsn: None,
            db_username: None,
            db_password: None,
        }
    }

    /// Resolve the database path from the DSN, or default to
    /// `<data_dir>/mq.db`.
    fn database_path(&self) -> Result<PathBuf> {
        let Some(dsn) = &self.db_dsn else {
            return Ok(self.data_dir.join("mq.db"));
        };
        let path = dsn
            .strip_prefix("sqlite:")
            .map(|rest| rest.strip_prefix("//").unwrap_or(rest))
            .ok_or_else(|| StorageError::Configuration {
                field: "db_dsn",
                reason: format!("unsupported DSN {dsn:?}; only sqlite: is available"),
            })?;
        Ok(PathBuf::from(path))
    }

    /// Assemble the default composition:
    /// `Complex(front = memory, back = Throttle(BodyStore(SqliteMetaStore)))`.
    ///
    /// # Errors
    /// Fails if the data directory cannot be created, the DSN is not SQLite,
    /// or the database cannot be opened or migrated.
    pub async fn into_storage(self) -> Result<DefaultStorage> {
        let database = self.database_path()?;
        std::fs::create_dir_all(&self.data_dir)?;

        let name = LogName::root("STORE");
        let back_name = name.child("BACK");

        let info = SqliteMetaStore::open_named(
            database,
            back_name.child("THROTTLE").child("BODY").child("INFO"),
        )
        .await?;
        let body = BodyStore::new_named(
            info,
            &self.data_dir,
            back_name.child("THROTTLE").child("BODY"),
        )?;
        let back = Throttle::new(body, self.throttle_max).named(back_name.child("THROTTLE"));
        let front = self.front_store.into_front(name.child("FRONT"));

        tracing::info!(
            target: "kestrel",
            data_dir = %self.data_dir.display(),
            timeout = self.timeout,
            throttle_max = self.throttle_max,
            "assembled storage stack"
        );

        Ok(Complex::new_named(
            front,
            back,
            Duration::from_secs(self.timeout),
            name,
        ))
    }
}

/// The stock deployment's engine stack.
pub type DefaultStorage =
    Complex<Box<dyn Storage>, Throttle<BodyStore<SqliteMetaStore>>>;
