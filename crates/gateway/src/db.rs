//! Durable persistence (§6: "Persisted state: sitekey records and policy
//! snapshots"). Everything else in this service is ephemeral and lives in
//! `moka` caches instead.

use sqlx::PgPool;

use crate::error::GatewayError;
use crate::models::{PolicyRecord, PolicyRow, SitekeyRecord};

pub async fn fetch_sitekey(pool: &PgPool, sitekey: &str) -> Result<Option<SitekeyRecord>, GatewayError> {
    let record = sqlx::query_as::<_, SitekeyRecord>(
        "SELECT sitekey, secret_key_hash, created_at FROM sitekeys WHERE sitekey = $1",
    )
    .bind(sitekey)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn fetch_sitekey_by_secret_hash(
    pool: &PgPool,
    secret_key_hash: &str,
) -> Result<Option<SitekeyRecord>, GatewayError> {
    let record = sqlx::query_as::<_, SitekeyRecord>(
        "SELECT sitekey, secret_key_hash, created_at FROM sitekeys WHERE secret_key_hash = $1",
    )
    .bind(secret_key_hash)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn insert_sitekey(pool: &PgPool, sitekey: &str, secret_key_hash: &str) -> Result<(), GatewayError> {
    sqlx::query("INSERT INTO sitekeys (sitekey, secret_key_hash) VALUES ($1, $2)")
        .bind(sitekey)
        .bind(secret_key_hash)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn fetch_policy(pool: &PgPool, sitekey: &str) -> Result<Option<PolicyRecord>, GatewayError> {
    let row = sqlx::query_as::<_, PolicyRow>(
        "SELECT sitekey, policy_json FROM policies WHERE sitekey = $1",
    )
    .bind(sitekey)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let mut record: PolicyRecord = serde_json::from_value(row.policy_json)
                .map_err(|e| GatewayError::Internal(format!("corrupt policy row: {e}")))?;
            record.sitekey = row.sitekey;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

pub async fn upsert_policy(pool: &PgPool, policy: &PolicyRecord) -> Result<(), GatewayError> {
    let json = serde_json::to_value(policy)
        .map_err(|e| GatewayError::Internal(format!("cannot serialize policy: {e}")))?;
    sqlx::query(
        "INSERT INTO policies (sitekey, policy_json) VALUES ($1, $2)
         ON CONFLICT (sitekey) DO UPDATE SET policy_json = EXCLUDED.policy_json",
    )
    .bind(&policy.sitekey)
    .bind(json)
    .execute(pool)
    .await?;
    Ok(())
}
