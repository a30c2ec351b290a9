use std::time::Duration;

use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use veil_db::{Database, DatabaseConfig};

const DB_NAME: &str = "veil_test";

/// Start Postgres 16 and return a migrated `Database` on it.
///
/// Keep the container alive for as long as the test uses the database.
pub async fn setup_test_db() -> (Database, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", DB_NAME)
        .start()
        .await
        .expect("postgres container should start");

    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("mapped postgres port");

    let config = DatabaseConfig {
        url: format!("postgresql://postgres:postgres@{host}:{port}/{DB_NAME}"),
        max_connections: 5,
    };

    // The ready message is logged once before the init restart; keep trying.
    let mut attempt = 0;
    let db = loop {
        match Database::open(&config).await {
            Ok(db) => break db,
            Err(e) if attempt < 30 => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "Postgres not ready yet");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => panic!("postgres never became reachable: {e}"),
        }
    };

    db.ping().await.expect("fresh database should answer");
    (db, container)
}
