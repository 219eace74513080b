// tests/integration_test.rs

//! End-to-end migration and rollback tests against real PostgreSQL
//! containers. Source and destination are each a fresh `postgres:16`
//! container; schema and seed data are loaded with raw `tokio_postgres`
//! statements rather than a fixture loader, since that loader is an
//! external collaborator this crate does not implement.

use pgswap::config::Endpoint;
use pgswap::engine::MigrationEngine;
use pgswap::rollback;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::NoTls;

struct TestDb {
    _container: ContainerAsync<Postgres>,
    endpoint: Endpoint,
}

async fn start_db() -> TestDb {
    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start postgres container");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get container port");
    let endpoint = Endpoint {
        host: "127.0.0.1".to_string(),
        port,
        database: "postgres".to_string(),
        user: "postgres".to_string(),
        secret: "postgres".to_string(),
        tls: false,
    };
    TestDb {
        _container: container,
        endpoint,
    }
}

async fn direct_client(endpoint: &Endpoint) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(&endpoint.to_conn_string(), NoTls)
        .await
        .expect("failed to connect to test database");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

const S1_SCHEMA: &str = "
    CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT NOT NULL, email TEXT NOT NULL);
    CREATE TABLE posts (id SERIAL PRIMARY KEY, title TEXT NOT NULL, user_id INTEGER REFERENCES users(id));
    CREATE TABLE comments (id SERIAL PRIMARY KEY, post_id INTEGER REFERENCES posts(id), content TEXT NOT NULL);
";

async fn seed_source(client: &tokio_postgres::Client) {
    client.batch_execute(S1_SCHEMA).await.unwrap();
    client
        .batch_execute(
            "INSERT INTO users (name, email) VALUES ('John', 'john@x'), ('Jane', 'jane@x');
             INSERT INTO posts (title, user_id) VALUES ('post one', 1), ('post two', 2);
             INSERT INTO comments (post_id, content) VALUES (1, 'first'), (2, 'second');",
        )
        .await
        .unwrap();
}

async fn seed_destination(client: &tokio_postgres::Client) {
    client.batch_execute(S1_SCHEMA).await.unwrap();
    client
        .batch_execute(
            "INSERT INTO users (name, email) VALUES ('John Modified', 'john+modified@x'), \
             ('Jane Modified', 'jane+modified@x');
             INSERT INTO posts (title, user_id) VALUES ('old post one', 1), ('old post two', 2);
             INSERT INTO comments (post_id, content) VALUES (1, 'old first'), (2, 'old second');",
        )
        .await
        .unwrap();
}

/// S1 — basic three-table migration with no preserved tables: the
/// destination ends up with the source's data, and the outgoing
/// destination contents survive in a backup namespace.
#[tokio::test]
async fn basic_migration_promotes_source_and_backs_up_destination() {
    let source = start_db().await;
    let dest = start_db().await;

    seed_source(&direct_client(&source.endpoint).await).await;
    seed_destination(&direct_client(&dest.endpoint).await).await;

    let engine = MigrationEngine::new(source.endpoint.clone(), dest.endpoint.clone(), 2).unwrap();
    let outcome = engine.migrate(Vec::new()).await.unwrap();
    assert!(outcome.success);
    let backup_namespace = outcome.backup_namespace.expect("swap must have committed");

    let dest_client = direct_client(&dest.endpoint).await;
    let name: String = dest_client
        .query_one("SELECT name FROM public.users WHERE id = 1", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(name, "John");

    let backup_name: String = dest_client
        .query_one(
            &format!("SELECT name FROM \"{backup_namespace}\".users WHERE id = 1"),
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(backup_name, "John Modified");

    // The source's own public namespace is untouched by the temporary
    // rename-to-shadow-and-back used to produce the dump.
    let source_client = direct_client(&source.endpoint).await;
    let source_name: String = source_client
        .query_one("SELECT name FROM public.users WHERE id = 1", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(source_name, "John");
}

/// S2 — a preserved table's live contents survive the swap while
/// non-preserved tables take on the source's contents.
#[tokio::test]
async fn preserved_table_retains_destination_contents() {
    let source = start_db().await;
    let dest = start_db().await;

    seed_source(&direct_client(&source.endpoint).await).await;
    seed_destination(&direct_client(&dest.endpoint).await).await;

    let engine = MigrationEngine::new(source.endpoint.clone(), dest.endpoint.clone(), 2).unwrap();
    let outcome = engine
        .migrate(vec!["users".to_string()])
        .await
        .unwrap();
    assert!(outcome.success);

    let dest_client = direct_client(&dest.endpoint).await;
    let name: String = dest_client
        .query_one("SELECT name FROM public.users WHERE id = 1", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(name, "John Modified", "preserved table must keep its live contents");

    let post_title: String = dest_client
        .query_one("SELECT title FROM public.posts WHERE id = 1", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(post_title, "post one", "non-preserved table takes the source's contents");
}

/// S4 — rollback restores the destination's pre-migration contents and
/// consumes the backup; a second rollback to the same backup fails.
#[tokio::test]
async fn rollback_restores_pre_migration_contents_and_consumes_backup() {
    let source = start_db().await;
    let dest = start_db().await;

    seed_source(&direct_client(&source.endpoint).await).await;
    seed_destination(&direct_client(&dest.endpoint).await).await;

    let engine = MigrationEngine::new(source.endpoint.clone(), dest.endpoint.clone(), 2).unwrap();
    let outcome = engine.migrate(Vec::new()).await.unwrap();
    let backup_namespace = outcome.backup_namespace.unwrap();
    let backup_ts: i64 = backup_namespace.strip_prefix("backup_").unwrap().parse().unwrap();

    let dest_pool = pgswap::pool::build_pool(&dest.endpoint, 4).unwrap();
    rollback::rollback(&dest_pool, backup_ts, &[]).await.unwrap();

    let dest_client = direct_client(&dest.endpoint).await;
    let name: String = dest_client
        .query_one("SELECT name FROM public.users WHERE id = 1", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(name, "John Modified");

    let client = dest_pool.get().await.unwrap();
    assert!(!pgswap::namespace::namespace_exists(&client, &backup_namespace)
        .await
        .unwrap());

    let second_attempt = rollback::rollback(&dest_pool, backup_ts, &[]).await;
    assert!(second_attempt.is_err(), "the consumed backup cannot be rolled back to again");
}

/// S6 — dry-run reports row counts without mutating either database.
#[tokio::test]
async fn dry_run_reports_without_mutating() {
    let source = start_db().await;
    let dest = start_db().await;

    seed_source(&direct_client(&source.endpoint).await).await;
    seed_destination(&direct_client(&dest.endpoint).await).await;

    let engine = MigrationEngine::new(source.endpoint.clone(), dest.endpoint.clone(), 2).unwrap();
    let report = engine.dry_run(&[]).await.unwrap();

    let users_report = report
        .source_tables
        .iter()
        .find(|t| t.name == "users")
        .expect("users table reported");
    assert_eq!(users_report.row_count, 2);

    let dest_client = direct_client(&dest.endpoint).await;
    let name: String = dest_client
        .query_one("SELECT name FROM public.users WHERE id = 1", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(name, "John Modified", "dry run must not mutate the destination");

    let client = dest_pool_client(&dest.endpoint).await;
    assert!(!pgswap::namespace::shadow_exists(&client).await.unwrap());
}

async fn dest_pool_client(endpoint: &Endpoint) -> deadpool_postgres::Object {
    let pool = pgswap::pool::build_pool(endpoint, 2).unwrap();
    pool.get().await.unwrap()
}
