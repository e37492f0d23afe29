use std::path::Path;

use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;

use crate::store::StoreError;

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
    pub db: Surreal<Db>,
}

/// Open (or create) the on-disk database and run migrations.
pub async fn open(path: &Path) -> Result<DbHandle, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Surreal::new::<SurrealKv>(path.to_path_buf())
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;
    init(db).await
}

/// Volatile database for tests and dry runs.
pub async fn in_memory() -> Result<DbHandle, StoreError> {
    let db = Surreal::new::<Mem>(())
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;
    init(db).await
}

async fn init(db: Surreal<Db>) -> Result<DbHandle, StoreError> {
    db.use_ns("courier")
        .use_db("courier")
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;

    run_migrations(&db).await?;

    Ok(DbHandle { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), StoreError> {
    db.query(SCHEMA_V1)
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?
        .check()
        .map_err(|e| StoreError::Db(e.to_string()))?;
    Ok(())
}

// Timestamps are RFC 3339 strings with fixed precision, so they sort lexically.
const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE transfer_job SCHEMAFULL;
    DEFINE FIELD OVERWRITE job_id ON transfer_job TYPE string;
    DEFINE FIELD OVERWRITE artifact_id ON transfer_job TYPE string;
    DEFINE FIELD OVERWRITE artifact ON transfer_job TYPE string;
    DEFINE FIELD OVERWRITE status ON transfer_job TYPE string;
    DEFINE FIELD OVERWRITE priority ON transfer_job TYPE int DEFAULT 1;
    DEFINE FIELD OVERWRITE attempts ON transfer_job TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE max_attempts ON transfer_job TYPE int DEFAULT 5;
    DEFINE FIELD OVERWRITE last_error ON transfer_job TYPE option<string>;
    DEFINE FIELD OVERWRITE error_kind ON transfer_job TYPE option<string>;
    DEFINE FIELD OVERWRITE remote_id ON transfer_job TYPE option<string>;
    DEFINE FIELD OVERWRITE created_at ON transfer_job TYPE string;
    DEFINE FIELD OVERWRITE last_attempt_at ON transfer_job TYPE option<string>;
    DEFINE FIELD OVERWRITE next_retry_at ON transfer_job TYPE option<string>;
    DEFINE INDEX OVERWRITE idx_transfer_job_id ON transfer_job FIELDS job_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_transfer_job_status ON transfer_job FIELDS status;
";
