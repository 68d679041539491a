//! Shared test utilities for cam integration tests.
//!
//! Each test gets its own SQLite database file in a fresh `tempfile`
//! directory, with migrations applied. The directory is kept alive for the
//! lifetime of the returned guard and removed on drop.

use cam_db::config::DbConfig;
use cam_db::pool;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Holds the temp directory backing a test database alive; drop it only
/// after the pool is no longer needed.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a fresh SQLite database with migrations applied, returning the
/// pool plus a guard that deletes the backing file when dropped.
pub async fn create_test_db() -> TestDb {
    let dir = tempfile::tempdir().expect("failed to create temp dir for test database");
    let db_path = dir.path().join("test.db");
    let config = DbConfig::new(db_path.to_string_lossy().to_string());

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to create test database pool");
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    TestDb { pool, _dir: dir }
}

/// Convenience wrapper for call sites that only need the pool and are happy
/// to leak the backing temp directory for the duration of the process (unit
/// tests under `#[tokio::test]`, one process per test binary run).
pub async fn create_test_pool() -> SqlitePool {
    let db = create_test_db().await;
    std::mem::forget(db._dir);
    db.pool
}
