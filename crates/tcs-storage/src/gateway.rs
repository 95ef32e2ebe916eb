//! Persistence gateway contract and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tcs_core::{CommitResult, NaturalKey, ReconcileBatch, TournamentRecord};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("external id {external_id} is claimed by more than one tournament")]
    DuplicateExternalId { external_id: String },
    #[error("tournament {0} already exists")]
    DuplicateId(Uuid),
    #[error("tournament {0} not found")]
    MissingRecord(Uuid),
    #[error("corrupt row for tournament {id}: {message}")]
    CorruptRow { id: Uuid, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read helpers the reconciler matches candidates against.
#[async_trait]
pub trait TournamentLookup: Send + Sync {
    /// Matches the canonical id as well as any id a secondary source reported.
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<TournamentRecord>, PersistenceError>;

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Vec<TournamentRecord>, PersistenceError>;

    /// Records starting within `[from, to]`, used by tolerant matching policies.
    async fn find_in_start_window(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TournamentRecord>, PersistenceError>;

    /// Non-archived records that `source_id` has matched at least once.
    async fn find_active_for_source(
        &self,
        source_id: &str,
    ) -> Result<Vec<TournamentRecord>, PersistenceError>;
}

#[async_trait]
pub trait PersistenceGateway: TournamentLookup {
    /// Apply a whole batch atomically: every write lands or none does.
    async fn commit(&self, batch: &ReconcileBatch) -> Result<CommitResult, PersistenceError>;
}

pub(crate) fn commit_counts(batch: &ReconcileBatch) -> CommitResult {
    CommitResult {
        inserted: batch.inserts.len(),
        updated: batch.updates.len(),
        noop: batch.noops.len(),
        archived: batch.archived_count(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
    records: RwLock<HashMap<Uuid, TournamentRecord>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = TournamentRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    /// All stored records ordered by creation time.
    pub async fn snapshot(&self) -> Vec<TournamentRecord> {
        let mut out = self.records.read().await.values().cloned().collect::<Vec<_>>();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn get(&self, id: Uuid) -> Option<TournamentRecord> {
        self.records.read().await.get(&id).cloned()
    }

    async fn filtered(&self, pred: impl Fn(&TournamentRecord) -> bool) -> Vec<TournamentRecord> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }
}

fn upsert(staged: &mut HashMap<Uuid, TournamentRecord>, record: &TournamentRecord) {
    staged.insert(record.id, record.clone());
}

fn mark_stale(
    staged: &mut HashMap<Uuid, TournamentRecord>,
    record: &TournamentRecord,
) -> Result<(), PersistenceError> {
    let current = staged
        .get_mut(&record.id)
        .ok_or(PersistenceError::MissingRecord(record.id))?;
    current.status = record.status;
    current.miss_count = record.miss_count;
    current.claims = record.claims.clone();
    current.updated_at = record.updated_at;
    Ok(())
}

fn ensure_unique_external_ids(
    staged: &HashMap<Uuid, TournamentRecord>,
) -> Result<(), PersistenceError> {
    let mut seen = HashMap::new();
    for record in staged.values() {
        for external_id in record.external_ids() {
            if seen.insert(external_id, record.id).is_some() {
                return Err(PersistenceError::DuplicateExternalId {
                    external_id: external_id.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl TournamentLookup for MemoryGateway {
    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<TournamentRecord>, PersistenceError> {
        Ok(self
            .filtered(|r| r.has_external_id(external_id))
            .await
            .into_iter()
            .next())
    }

    async fn find_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        Ok(self.filtered(|r| r.natural_key() == *key).await)
    }

    async fn find_in_start_window(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        Ok(self
            .filtered(|r| r.start_date >= from && r.start_date <= to)
            .await)
    }

    async fn find_active_for_source(
        &self,
        source_id: &str,
    ) -> Result<Vec<TournamentRecord>, PersistenceError> {
        Ok(self
            .filtered(|r| r.is_active() && r.claims.contains_key(source_id))
            .await)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn commit(&self, batch: &ReconcileBatch) -> Result<CommitResult, PersistenceError> {
        let mut guard = self.records.write().await;
        // Writes go to a copy that replaces the live map only once everything applied.
        let mut staged = guard.clone();

        for record in &batch.inserts {
            if staged.contains_key(&record.id) {
                return Err(PersistenceError::DuplicateId(record.id));
            }
            upsert(&mut staged, record);
        }
        for record in batch.updates.iter().chain(&batch.noops) {
            upsert(&mut staged, record);
        }
        for stale in &batch.stale {
            mark_stale(&mut staged, &stale.record)?;
        }
        ensure_unique_external_ids(&staged)?;

        *guard = staged;
        Ok(commit_counts(batch))
    }
}
