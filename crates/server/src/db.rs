//! Pool connection for the composition root. Grounded on `db.rs`'s
//! `init_pg_pool`; the actual bounded-pool/health-check/migration work
//! lives in `seg_store::StorePool` (§9 "Connection pool").

use seg_core::Config;
use seg_store::StorePool;

pub async fn connect(config: &Config) -> anyhow::Result<StorePool> {
    StorePool::connect(&config.database_url, config.db_max_pool_size).await
}
