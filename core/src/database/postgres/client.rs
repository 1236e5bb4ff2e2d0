use std::{env, time::Duration};

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use dotenv::dotenv;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::{task, time::timeout};
use tokio_postgres::{config::SslMode, Config};
use tracing::{debug, error};

use crate::database::{
    postgres::session::PostgresSession,
    store::{Connector, Session, StoreError},
};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

pub type PostgresPool = Pool<PostgresConnectionManager<MakeTlsConnector>>;

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,
}

/// Connection options that do not live in the connection string.
#[derive(Debug, Clone, Copy)]
pub struct PostgresOptions {
    pub pool_size: u32,
    pub disable_ssl: bool,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        PostgresOptions { pool_size: 10, disable_ssl: false }
    }
}

/// PostgreSQL backend of the store seam.
///
/// Bulk paths get dedicated connections from [`Connector::open`]; repository
/// calls borrow from the bb8 pool through [`Connector::acquire`].
#[derive(Clone)]
pub struct PostgresClient {
    config: Config,
    tls_connector: MakeTlsConnector,
    pool: PostgresPool,
}

impl PostgresClient {
    pub async fn new(
        connection_str: &str,
        options: PostgresOptions,
    ) -> Result<Self, PostgresConnectionError> {
        async fn _new(
            connection_str: &str,
            options: PostgresOptions,
            disable_ssl: bool,
        ) -> Result<PostgresClient, PostgresConnectionError> {
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            // Perform a direct connection test
            let (client, connection) =
                match timeout(CONNECT_TIMEOUT, config.connect(tls_connector.clone())).await {
                    Ok(Ok((client, connection))) => (client, connection),
                    Ok(Err(e)) => {
                        // retry without ssl if ssl has been attempted and failed
                        if !disable_ssl
                            && config.get_ssl_mode() != SslMode::Disable
                            && !connection_str.contains("sslmode=require")
                        {
                            return Box::pin(_new(connection_str, options, true)).await;
                        }
                        error!("Error connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    Err(e) => {
                        error!("Timeout connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                };

            let connection_handle = task::spawn(connection);

            match client.query_one("SELECT 1", &[]).await {
                Ok(_) => {}
                Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            };

            // Drop the client and ensure the connection handle completes
            drop(client);
            match connection_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(_)) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
                Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            }

            let manager = PostgresConnectionManager::new(config.clone(), tls_connector.clone());
            let pool = Pool::builder().max_size(options.pool_size).build(manager).await?;

            Ok(PostgresClient { config, tls_connector, pool })
        }

        _new(connection_str, options, options.disable_ssl).await
    }

    /// Builds a client from `DATABASE_URL`.
    pub async fn from_env(options: PostgresOptions) -> Result<Self, PostgresConnectionError> {
        let connection_str = connection_string()?;
        Self::new(&connection_str, options).await
    }

    pub fn pool(&self) -> &PostgresPool {
        &self.pool
    }

    async fn connect_dedicated(&self) -> Result<PostgresSession, StoreError> {
        let (client, connection) =
            match timeout(CONNECT_TIMEOUT, self.config.connect(self.tls_connector.clone())).await {
                Ok(result) => result?,
                Err(_) => {
                    error!("Timeout opening a dedicated database connection");
                    return Err(PostgresConnectionError::CanNotConnectToDatabase.into());
                }
            };

        let connection_handle = task::spawn(async move {
            if let Err(e) = connection.await {
                error!("Dedicated database connection closed with error: {}", e);
            }
        });

        debug!("Opened dedicated database connection");
        Ok(PostgresSession::dedicated(client, connection_handle))
    }
}

#[async_trait]
impl Connector for PostgresClient {
    async fn open(&self) -> Result<Box<dyn Session>, StoreError> {
        Ok(Box::new(self.connect_dedicated().await?))
    }

    async fn acquire(&self) -> Result<Box<dyn Session>, StoreError> {
        let conn = self.pool.get_owned().await?;
        Ok(Box::new(PostgresSession::pooled(conn)))
    }
}
