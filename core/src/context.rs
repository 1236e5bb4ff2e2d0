use std::{path::Path, sync::Arc};

use tracing::info;

use crate::{
    clock::Clock,
    config::{read_config, ConfigError, SyncConfig},
    database::{
        postgres::client::{connection_string, PostgresClient, PostgresConnectionError},
        store::Connector,
    },
    repository::Repository,
    schema::{Persistable, SchemaError, SchemaIntrospector},
};

#[derive(thiserror::Error, Debug)]
pub enum DataContextError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Connection(#[from] PostgresConnectionError),
}

/// Everything repositories and bulk engines share: the store, the cached
/// row-type descriptions, the clock and the tuning options.
#[derive(Clone)]
pub struct DataContext {
    connector: Arc<dyn Connector>,
    introspector: Arc<SchemaIntrospector>,
    clock: Clock,
    config: SyncConfig,
}

impl DataContext {
    pub fn new(connector: Arc<dyn Connector>, config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let clock = config.clock()?;
        let introspector = Arc::new(SchemaIntrospector::new(config.tables.clone()));

        Ok(DataContext { connector, introspector, clock, config })
    }

    /// Connects to the PostgreSQL database named by `DATABASE_URL`.
    pub async fn connect(config: SyncConfig) -> Result<Self, DataContextError> {
        let connection_str = connection_string().map_err(PostgresConnectionError::from)?;
        Self::connect_to(&connection_str, config).await
    }

    pub async fn connect_to(
        connection_str: &str,
        config: SyncConfig,
    ) -> Result<Self, DataContextError> {
        config.validate()?;
        let client = PostgresClient::new(connection_str, config.postgres_options()).await?;
        info!("Connected to database with a pool of {} connections", config.pool_size);

        Ok(Self::new(Arc::new(client), config)?)
    }

    /// Reads the YAML config at `config_path` and connects with it.
    pub async fn from_config_file(config_path: &Path) -> Result<Self, DataContextError> {
        let config = read_config(config_path)?;
        Self::connect(config).await
    }

    /// Replaces the clock, e.g. with [`Clock::frozen`].
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn introspector(&self) -> &SchemaIntrospector {
        &self.introspector
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn repository<T: Persistable>(&self) -> Result<Repository<T>, SchemaError> {
        let schema = self.introspector.describe::<T>()?;
        Ok(Repository::new(self.connector(), schema, self.clock, self.config.insert_options()))
    }
}
