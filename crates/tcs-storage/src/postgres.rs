//! Postgres-backed gateway; one transaction per source batch.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tcs_core::{CommitResult, NaturalKey, ReconcileBatch, TournamentRecord, TournamentStatus};
use tracing::debug;

use crate::gateway::{commit_counts, PersistenceError, PersistenceGateway, TournamentLookup};

const SELECT_COLUMNS: &str = "SELECT id, external_id, name, location, category, start_date, \
     end_date, status, source_id, source_url, content_hash, created_at, updated_at, \
     last_seen_at, miss_count, claims, source_ids FROM tournaments";

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_records(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<TournamentRecord, PersistenceError> {
    let id: uuid::Uuid = row.try_get("id")?;
    let corrupt = |message: String| PersistenceError::CorruptRow { id, message };

    let status_text: String = row.try_get("status")?;
    let status = TournamentStatus::parse(&status_text)
        .ok_or_else(|| corrupt(format!("unknown status {status_text}")))?;
    let miss_count: i32 = row.try_get("miss_count")?;
    let miss_count = u32::try_from(miss_count)
        .map_err(|_| corrupt(format!("negative miss_count {miss_count}")))?;
    let claims: Json<BTreeMap<String, u32>> = row.try_get("claims")?;
    let source_ids: Json<BTreeMap<String, String>> = row.try_get("source_ids")?;

    Ok(TournamentRecord {
        id,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        location: row.try_get("location")?,
        category: row.try_get("category")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        status,
        source_id: row.try_get("source_id")?,
        source_url: row.try_get("source_url")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        miss_count,
        claims: claims.0,
        source_ids: source_ids.0,
    })
}

async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    record: &TournamentRecord,
) -> Result<(), PersistenceError> {
    write_record(tx, record, false).await
}

async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    record: &TournamentRecord,
) -> Result<(), PersistenceError> {
    write_record(tx, record, true).await
}

async fn write_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &TournamentRecord,
    on_conflict_update: bool,
) -> Result<(), PersistenceError> {
    let key = record.natural_key();
    let mut sql = String::from(
        "INSERT INTO tournaments (id, external_id, name, location, category, start_date, end_date, \
         status, source_id, source_url, content_hash, name_key, location_key, created_at, \
         updated_at, last_seen_at, miss_count, claims, source_ids) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
         $18, $19)",
    );
    if on_conflict_update {
        sql.push_str(
            " ON CONFLICT (id) DO UPDATE SET external_id = EXCLUDED.external_id, \
             name = EXCLUDED.name, location = EXCLUDED.location, category = EXCLUDED.category, \
             start_date = EXCLUDED.start_date, end_date = EXCLUDED.end_date, \
             status = EXCLUDED.status, source_id = EXCLUDED.source_id, \
             source_url = EXCLUDED.source_url, content_hash = EXCLUDED.content_hash, \
             name_key = EXCLUDED.name_key, location_key = EXCLUDED.location_key, \
             updated_at = EXCLUDED.updated_at, last_seen_at = EXCLUDED.last_seen_at, \
             miss_count = EXCLUDED.miss_count, claims = EXCLUDED.claims, \
             source_ids = EXCLUDED.source_ids",
        );
    }

    sqlx::query(&sql)
        .bind(record.id)
        .bind(&record.external_id)
        .bind(&record.name)
        .bind(&record.location)
        .bind(&record.category)
        .bind(record.start_date)
        .bind(record.end_date)
        .bind(record.status.as_str())
        .bind(&record.source_id)
        .bind(&record.source_url)
        .bind(&record.content_hash)
        .bind(&key.name)
        .bind(&key.location)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.last_seen_at)
        .bind(record.miss_count as i32)
        .bind(Json(&record.claims))
        .bind(Json(&record.source_ids))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn mark_stale(
    tx: &mut Transaction<'_, Postgres>,
    record: &TournamentRecord,
) -> Result<(), PersistenceError> {
    let result = sqlx::query(
        "UPDATE tournaments SET status = $2, miss_count = $3, claims = $4, updated_at = $5 \
         WHERE id = $1",
    )
    .bind(record.id)
    .bind(record.status.as_str())
    .bind(record.miss_count as i32)
    .bind(Json(&record.claims))
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(PersistenceError::MissingRecord(record.id));
    }
    Ok(())
}

#[async_trait]
impl TournamentLookup for PgGateway {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<TournamentRecord>, PersistenceError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE external_id = $1 OR EXISTS \
             (SELECT 1 FROM jsonb_each_text(source_ids) AS ids(source, value) \
             WHERE ids.value = $1) \
             ORDER BY external_id = $1 DESC NULLS LAST LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE name_key = $1 AND start_date = $2 AND location_key = $3"
        );
        self.fetch_records(
            sqlx::query(&sql)
                .bind(&key.name)
                .bind(key.start_date)
                .bind(&key.location),
        )
        .await
    }

    async fn find_in_start_window(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        let sql = format!("{SELECT_COLUMNS} WHERE start_date BETWEEN $1 AND $2");
        self.fetch_records(sqlx::query(&sql).bind(from).bind(to)).await
    }

    async fn find_active_for_source(
        &self,
        source_id: &str,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        let sql = format!("{SELECT_COLUMNS} WHERE status <> 'Cancelled' AND claims ? $1");
        self.fetch_records(sqlx::query(&sql).bind(source_id)).await
    }
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn commit(&self, batch: &ReconcileBatch) -> Result<CommitResult, PersistenceError> {
        // Any early return drops `tx`, which rolls the whole batch back.
        let mut tx = self.pool.begin().await?;

        for record in &batch.inserts {
            insert(&mut tx, record).await?;
        }
        for record in batch.updates.iter().chain(&batch.noops) {
            upsert(&mut tx, record).await?;
        }
        for stale in &batch.stale {
            mark_stale(&mut tx, &stale.record).await?;
        }

        tx.commit().await?;
        debug!(source_id = %batch.source_id, "committed batch");
        Ok(commit_counts(batch))
    }
}
