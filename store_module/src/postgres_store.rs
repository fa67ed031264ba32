use std::env;
use std::time::Duration;

use postgres_native_tls::MakeTlsConnector;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use serde_json::Value;
use tracing::{debug, error};

use crate::{empty_object, validate_key, InstallationId, IntegrationStore, StoreError};

const TABLE_PREFIX: &str = "t_";

#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<postgres::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: postgres::Error) {
        error!("store postgres pool error: {:?}", err);
    }
}

/// One table per installation (`t_<id>`), one row per key.
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool<PostgresConnectionManager<MakeTlsConnector>>,
}

impl PostgresStore {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        let config: postgres::Config = database_url.parse()?;

        let mut tls_builder = native_tls::TlsConnector::builder();
        if resolve_bool_env("STEWARD_DB_TLS_ALLOW_INVALID_CERTS") {
            tls_builder.danger_accept_invalid_certs(true);
            tls_builder.danger_accept_invalid_hostnames(true);
        }
        let tls_connector = tls_builder
            .build()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let tls = MakeTlsConnector::new(tls_connector);

        let manager = PostgresConnectionManager::new(config, tls);
        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(10))
            .idle_timeout(Some(Duration::from_secs(300)))
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        Ok(Self { pool })
    }

    fn connection(
        &self,
    ) -> Result<PooledConnection<PostgresConnectionManager<MakeTlsConnector>>, StoreError> {
        Ok(self.pool.get()?)
    }

    fn ensure_table(
        conn: &mut PooledConnection<PostgresConnectionManager<MakeTlsConnector>>,
        installation: InstallationId,
    ) -> Result<(), StoreError> {
        let statement = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
            table = table_name(installation)
        );
        conn.batch_execute(&statement)?;
        Ok(())
    }
}

impl IntegrationStore for PostgresStore {
    fn list_installations(
        &self,
    ) -> Result<Box<dyn Iterator<Item = InstallationId> + '_>, StoreError> {
        let mut conn = self.connection()?;
        let rows = conn.query(
            "SELECT table_name::text FROM information_schema.tables
             WHERE table_type = 'BASE TABLE' AND table_schema = current_schema()",
            &[],
        )?;
        let names: Vec<String> = rows.iter().map(|row| row.get(0)).collect();
        Ok(Box::new(
            names
                .into_iter()
                .filter_map(|name| parse_table_name(&name)),
        ))
    }

    fn get(&self, installation: InstallationId, key: &str) -> Result<Value, StoreError> {
        validate_key(key)?;
        let mut conn = self.connection()?;
        Self::ensure_table(&mut conn, installation)?;
        let row = conn.query_opt(
            &format!(
                "SELECT data FROM {table} WHERE key = $1",
                table = table_name(installation)
            ),
            &[&key],
        )?;
        match row {
            Some(row) => {
                let data: String = row.get(0);
                Ok(serde_json::from_str(&data)?)
            }
            None => Ok(empty_object()),
        }
    }

    fn write(
        &self,
        installation: InstallationId,
        key: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        let encoded = serde_json::to_string(data)?;
        let mut conn = self.connection()?;
        Self::ensure_table(&mut conn, installation)?;
        conn.execute(
            &format!(
                "INSERT INTO {table} (key, data) VALUES ($1, $2)
                 ON CONFLICT (key) DO UPDATE SET data = excluded.data",
                table = table_name(installation)
            ),
            &[&key, &encoded],
        )?;
        debug!("wrote key {} for installation {}", key, installation);
        Ok(())
    }

    fn remove(&self, installation: InstallationId, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut conn = self.connection()?;
        Self::ensure_table(&mut conn, installation)?;
        let removed = conn.execute(
            &format!(
                "DELETE FROM {table} WHERE key = $1",
                table = table_name(installation)
            ),
            &[&key],
        )?;
        debug!(
            "removed {} row(s) for key {} in installation {}",
            removed, key, installation
        );
        Ok(())
    }
}

fn table_name(installation: InstallationId) -> String {
    format!("{}{}", TABLE_PREFIX, installation)
}

fn parse_table_name(name: &str) -> Option<InstallationId> {
    name.strip_prefix(TABLE_PREFIX)?.parse().ok()
}

fn resolve_bool_env(key: &str) -> bool {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_ascii_lowercase())
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
