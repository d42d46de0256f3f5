//! Testcontainer-backed Postgres fixtures for `presence-service`'s
//! integration tests.

use eyre::Context as _;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner as _;

/// The schema applied by [`postgres_testcontainer`], kept alongside the
/// hosting binary's copy under `presence-service/migrations/`.
const SCHEMA_SQL: &str = include_str!("../../presence-service/migrations/0001_init.sql");

/// A running Postgres testcontainer and a pool connected to it with the
/// schema already applied.
pub struct TestDatabase {
    /// Keeps the container alive for the test's duration; dropping this
    /// stops and removes it.
    pub container: ContainerAsync<Postgres>,
    /// A connection pool against the container, schema already migrated.
    pub pool: PgPool,
    /// The connection string the pool above was built from.
    pub connection_string: String,
}

/// Starts a fresh Postgres testcontainer and applies the service's schema.
pub async fn postgres_testcontainer() -> eyre::Result<TestDatabase> {
    let container = Postgres::default()
        .start()
        .await
        .context("while starting the postgres testcontainer")?;
    let connection_string = format!(
        "postgres://postgres:postgres@{}:{}/postgres",
        container
            .get_host()
            .await
            .context("while reading the container host")?,
        container
            .get_host_port_ipv4(5432)
            .await
            .context("while reading the container port")?,
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&connection_string)
        .await
        .context("while connecting to the testcontainer")?;
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(&pool)
        .await
        .context("while applying the schema")?;

    Ok(TestDatabase {
        container,
        pool,
        connection_string,
    })
}
