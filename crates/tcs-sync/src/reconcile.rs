//! Identity resolution and change classification for one source's candidates.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tcs_core::{
    ConflictKind, NaturalKey, ParsedTournament, ReconcileBatch, ReconcileConflict, StaleRecord,
    TournamentRecord, TournamentStatus,
};
use tcs_storage::{PersistenceError, TournamentLookup};
use tracing::{debug, warn};
use uuid::Uuid;

/// How loosely a natural key may match. The default is the exact key.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchPolicy {
    /// Allowed distance in days between start dates.
    pub date_tolerance_days: u32,
    /// Minimum Jaro-Winkler score on folded names; `None` demands equality.
    pub name_similarity: Option<f64>,
}

impl MatchPolicy {
    pub fn is_exact(&self) -> bool {
        self.date_tolerance_days == 0 && self.name_similarity.is_none()
    }

    pub fn keys_match(&self, candidate: &NaturalKey, stored: &NaturalKey) -> bool {
        if candidate.location != stored.location {
            return false;
        }
        let distance = (candidate.start_date - stored.start_date).num_days().unsigned_abs();
        if distance > u64::from(self.date_tolerance_days) {
            return false;
        }
        match self.name_similarity {
            Some(threshold) => jaro_winkler(&candidate.name, &stored.name) >= threshold,
            None => candidate.name == stored.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilePolicy {
    pub stale_miss_threshold: u32,
    pub match_policy: MatchPolicy,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            stale_miss_threshold: 3,
            match_policy: MatchPolicy::default(),
        }
    }
}

/// A record that already carries a different id from the same source is a
/// different tournament. Ids from other sources live in their own namespace.
fn external_ids_compatible(
    candidate: &ParsedTournament,
    source_id: &str,
    record: &TournamentRecord,
) -> bool {
    match (&candidate.external_id, record.source_ids.get(source_id)) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// Fold a sighting into a matched record.
///
/// Descriptive fields belong to the primary source; a source that brings the
/// missing external id takes that role over. Only adoption rewrites fields
/// when `primary_may_write` is false.
fn absorb(
    record: &mut TournamentRecord,
    candidate: &ParsedTournament,
    source_id: &str,
    primary_may_write: bool,
) {
    let adopts = record.external_id.is_none() && candidate.external_id.is_some();
    if adopts || (primary_may_write && record.source_id == source_id) {
        record.source_id = source_id.to_string();
        record.apply_candidate(candidate);
    }
    if let Some(external_id) = &candidate.external_id {
        record
            .source_ids
            .insert(source_id.to_string(), external_id.clone());
    }
    record.content_hash = record.compute_content_hash();
}

/// Most recently seen first, then oldest, then lowest id.
fn preference_order(a: &TournamentRecord, b: &TournamentRecord) -> std::cmp::Ordering {
    b.last_seen_at
        .cmp(&a.last_seen_at)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Persisted state a matched record is compared against.
struct Loaded {
    hash: String,
    status: TournamentStatus,
    source_ids: BTreeMap<String, String>,
}

impl Loaded {
    fn of(record: &TournamentRecord) -> Self {
        Self {
            hash: record.content_hash.clone(),
            status: record.status,
            source_ids: record.source_ids.clone(),
        }
    }

    fn differs_from(&self, record: &TournamentRecord) -> bool {
        self.hash != record.content_hash
            || self.status != record.status
            || self.source_ids != record.source_ids
    }
}

struct Touched {
    record: TournamentRecord,
    /// `None` for records inserted by this batch.
    loaded: Option<Loaded>,
}

enum Resolution {
    Insert,
    Existing(Box<TournamentRecord>),
    Duplicate(Uuid),
}

/// Working set of records this batch has inserted or matched so far.
#[derive(Default)]
struct WorkSet {
    touched: Vec<Touched>,
    index: HashMap<Uuid, usize>,
}

impl WorkSet {
    fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    fn push(&mut self, touched: Touched) {
        self.index.insert(touched.record.id, self.touched.len());
        self.touched.push(touched);
    }

    fn records(&self) -> impl Iterator<Item = &TournamentRecord> {
        self.touched.iter().map(|t| &t.record)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut TournamentRecord> {
        let slot = *self.index.get(&id)?;
        self.touched.get_mut(slot).map(|t| &mut t.record)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    /// Classify a source's candidates against stored state.
    ///
    /// Only lookup failures are errors. Ambiguous or repeated matches are
    /// resolved deterministically and reported in `conflicts`.
    pub async fn reconcile<L>(
        &self,
        source_id: &str,
        candidates: &[ParsedTournament],
        lookup: &L,
        now: DateTime<Utc>,
    ) -> Result<ReconcileBatch, PersistenceError>
    where
        L: TournamentLookup + ?Sized,
    {
        let today = now.date_naive();
        let threshold = self.policy.stale_miss_threshold;
        let mut batch = ReconcileBatch::new(source_id);
        let mut work = WorkSet::default();

        for candidate in candidates {
            let key = candidate.natural_key();
            let resolution = self
                .resolve(source_id, candidate, &key, lookup, &work, &mut batch)
                .await?;
            match resolution {
                Resolution::Duplicate(id) => {
                    warn!(
                        source_id,
                        natural_key = %key,
                        record_id = %id,
                        "duplicate candidate in batch"
                    );
                    // The first sighting keeps its fields; a later one may still
                    // contribute the external id it lacked.
                    if let Some(record) = work.get_mut(id) {
                        absorb(record, candidate, source_id, false);
                    }
                    batch.conflicts.push(ReconcileConflict {
                        kind: ConflictKind::DuplicateInBatch,
                        natural_key: key,
                        chosen_id: id,
                        candidate_ids: vec![id],
                    });
                }
                Resolution::Insert => {
                    let record = TournamentRecord::from_candidate(candidate, source_id, now);
                    debug!(source_id, record_id = %record.id, "new tournament");
                    work.push(Touched {
                        record,
                        loaded: None,
                    });
                }
                Resolution::Existing(record) => {
                    let mut record = *record;
                    let loaded = Loaded::of(&record);

                    absorb(&mut record, candidate, source_id, true);
                    record.claims.insert(source_id.to_string(), 0);
                    record.refresh_miss_count();
                    record.settle_status(threshold, today);
                    record.last_seen_at = now;
                    work.push(Touched {
                        record,
                        loaded: Some(loaded),
                    });
                }
            }
        }

        let touched_ids = work.index.keys().copied().collect::<HashSet<_>>();
        for touched in work.touched {
            let Touched { mut record, loaded } = touched;
            match loaded {
                None => batch.inserts.push(record),
                Some(loaded) if loaded.differs_from(&record) => {
                    record.updated_at = now;
                    batch.updates.push(record);
                }
                Some(_) => batch.noops.push(record),
            }
        }

        let mut absent = lookup
            .find_active_for_source(source_id)
            .await?
            .into_iter()
            .filter(|r| !touched_ids.contains(&r.id))
            .collect::<Vec<_>>();
        absent.sort_by_key(|r| r.id);
        for mut record in absent {
            *record.claims.entry(source_id.to_string()).or_insert(0) += 1;
            record.refresh_miss_count();
            record.settle_status(threshold, today);
            record.updated_at = now;
            let archived = !record.is_active();
            if archived {
                warn!(
                    source_id,
                    record_id = %record.id,
                    miss_count = record.miss_count,
                    "tournament archived after consecutive misses"
                );
            }
            batch.stale.push(StaleRecord { record, archived });
        }

        Ok(batch)
    }

    async fn resolve<L>(
        &self,
        source_id: &str,
        candidate: &ParsedTournament,
        key: &NaturalKey,
        lookup: &L,
        work: &WorkSet,
        batch: &mut ReconcileBatch,
    ) -> Result<Resolution, PersistenceError>
    where
        L: TournamentLookup + ?Sized,
    {
        let policy = &self.policy.match_policy;

        if let Some(external_id) = candidate.external_id.as_deref() {
            if let Some(seen) = work
                .records()
                .find(|r| r.has_external_id(external_id))
            {
                return Ok(Resolution::Duplicate(seen.id));
            }
            if let Some(stored) = lookup.find_by_external_id(external_id).await? {
                if work.contains(stored.id) {
                    return Ok(Resolution::Duplicate(stored.id));
                }
                return Ok(Resolution::Existing(Box::new(stored)));
            }
        }

        if let Some(seen) = work.records().find(|r| {
            external_ids_compatible(candidate, source_id, r)
                && policy.keys_match(key, &r.natural_key())
        }) {
            return Ok(Resolution::Duplicate(seen.id));
        }

        let stored = if policy.is_exact() {
            lookup.find_by_natural_key(key).await?
        } else {
            let tolerance = Days::new(u64::from(policy.date_tolerance_days));
            let from = key.start_date.checked_sub_days(tolerance).unwrap_or(key.start_date);
            let to = key.start_date.checked_add_days(tolerance).unwrap_or(key.start_date);
            lookup
                .find_in_start_window(from, to)
                .await?
                .into_iter()
                .filter(|r| policy.keys_match(key, &r.natural_key()))
                .collect()
        };
        let mut matches = stored
            .into_iter()
            .filter(|r| external_ids_compatible(candidate, source_id, r))
            .collect::<Vec<_>>();
        matches.sort_by(preference_order);

        let mut matches = matches.into_iter();
        let Some(chosen) = matches.next() else {
            return Ok(Resolution::Insert);
        };
        let others = matches.map(|r| r.id).collect::<Vec<_>>();
        if !others.is_empty() {
            let mut candidate_ids = others;
            candidate_ids.push(chosen.id);
            candidate_ids.sort();
            warn!(
                natural_key = %key,
                chosen_id = %chosen.id,
                matches = candidate_ids.len(),
                "ambiguous natural key; picked most recently seen record"
            );
            batch.conflicts.push(ReconcileConflict {
                kind: ConflictKind::AmbiguousNaturalKey,
                natural_key: key.clone(),
                chosen_id: chosen.id,
                candidate_ids,
            });
        }

        if work.contains(chosen.id) {
            return Ok(Resolution::Duplicate(chosen.id));
        }
        Ok(Resolution::Existing(Box::new(chosen)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tcs_storage::{MemoryGateway, PersistenceGateway};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, day, 6, 0, 0).single().unwrap()
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, m, d).unwrap()
    }

    fn candidate(external_id: Option<&str>, name: &str, start: NaiveDate) -> ParsedTournament {
        ParsedTournament {
            external_id: external_id.map(str::to_string),
            name: name.to_string(),
            location: "Berlin, Germany".to_string(),
            category: "Open".to_string(),
            start_date: start,
            end_date: start,
            source_url: "https://calendar.fide.com/".to_string(),
        }
    }

    fn reconciler(threshold: u32) -> Reconciler {
        Reconciler::new(ReconcilePolicy {
            stale_miss_threshold: threshold,
            ..Default::default()
        })
    }

    async fn sync(
        reconciler: &Reconciler,
        store: &MemoryGateway,
        source_id: &str,
        candidates: &[ParsedTournament],
        now: DateTime<Utc>,
    ) -> ReconcileBatch {
        let batch = reconciler
            .reconcile(source_id, candidates, store, now)
            .await
            .unwrap();
        store.commit(&batch).await.unwrap();
        batch
    }

    #[tokio::test]
    async fn second_identical_batch_is_all_noops() {
        let store = MemoryGateway::new();
        let r = reconciler(3);
        let batch = vec![
            candidate(Some("F1"), "City Open", date(5, 1)),
            candidate(None, "Lake Cup", date(6, 1)),
        ];

        let first = sync(&r, &store, "fide", &batch, at(1)).await;
        assert_eq!(first.inserts.len(), 2);

        let before = store.snapshot().await;
        let second = sync(&r, &store, "fide", &batch, at(2)).await;
        assert!(second.inserts.is_empty());
        assert!(second.updates.is_empty());
        assert_eq!(second.noops.len(), 2);
        assert!(second.stale.is_empty());

        let after = store.snapshot().await;
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.id, a.id);
            assert_eq!(b.content_hash, a.content_hash);
            assert_eq!(a.last_seen_at, at(2));
        }
    }

    #[tokio::test]
    async fn external_id_keeps_identity_through_renames() {
        let store = MemoryGateway::new();
        let r = reconciler(3);
        let first = [candidate(Some("F1"), "City Open", date(5, 1))];
        sync(&r, &store, "fide", &first, at(1)).await;
        let id = store.snapshot().await[0].id;

        let renamed = candidate(Some("F1"), "City Open 2030 (Round robin)", date(5, 2));
        let batch = sync(&r, &store, "fide", &[renamed], at(2)).await;

        assert_eq!(batch.updates.len(), 1);
        let stored = store.snapshot().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].name, "City Open 2030 (Round robin)");
        assert_eq!(stored[0].updated_at, at(2));
    }

    #[tokio::test]
    async fn natural_key_merges_across_sources_and_keeps_external_id() {
        let store = MemoryGateway::new();
        let r = reconciler(3);
        let federation = [candidate(None, "CITY  OPEN", date(5, 1))];
        sync(&r, &store, "federation", &federation, at(1)).await;
        let fide = [candidate(Some("FIDE123"), "City Open", date(5, 1))];
        let batch = sync(&r, &store, "fide", &fide, at(1)).await;

        assert!(batch.inserts.is_empty());
        assert_eq!(batch.updates.len(), 1);
        let stored = store.snapshot().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].external_id.as_deref(), Some("FIDE123"));
        assert_eq!(stored[0].source_id, "fide");
        assert_eq!(stored[0].claims.keys().collect::<Vec<_>>(), vec!["federation", "fide"]);

        // The secondary source no longer rewrites fields.
        let federation = [candidate(None, "city open", date(5, 1))];
        let batch = sync(&r, &store, "federation", &federation, at(2)).await;
        assert_eq!(batch.noops.len(), 1);
        assert_eq!(store.snapshot().await[0].name, "City Open");
    }

    #[tokio::test]
    async fn different_external_ids_never_merge_on_natural_key() {
        let store = MemoryGateway::new();
        let r = reconciler(3);
        let first = [candidate(Some("F1"), "City Open", date(5, 1))];
        sync(&r, &store, "fide", &first, at(1)).await;
        let second = [
            candidate(Some("F1"), "City Open", date(5, 1)),
            candidate(Some("F2"), "City Open", date(5, 1)),
        ];
        let batch = sync(&r, &store, "fide", &second, at(2)).await;
        assert_eq!(batch.inserts.len(), 1);
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn staleness_archives_at_threshold_and_resets_on_return() {
        let store = MemoryGateway::new();
        let r = reconciler(2);
        let listed = vec![
            candidate(None, "City Open", date(5, 1)),
            candidate(None, "Lake Cup", date(6, 1)),
        ];
        sync(&r, &store, "fed", &listed, at(1)).await;

        let only_lake = vec![listed[1].clone()];
        let first_miss = sync(&r, &store, "fed", &only_lake, at(2)).await;
        assert_eq!(first_miss.stale.len(), 1);
        assert!(!first_miss.stale[0].archived);
        let city = store
            .snapshot()
            .await
            .into_iter()
            .find(|t| t.name == "City Open")
            .unwrap();
        assert_eq!(city.miss_count, 1);
        assert_eq!(city.status, TournamentStatus::Scheduled);

        // A reappearance resets the counter.
        sync(&r, &store, "fed", &listed, at(3)).await;
        assert_eq!(store.get(city.id).await.unwrap().miss_count, 0);

        sync(&r, &store, "fed", &only_lake, at(4)).await;
        let second = sync(&r, &store, "fed", &only_lake, at(5)).await;
        assert_eq!(second.archived_count(), 1);
        let archived = store.get(city.id).await.unwrap();
        assert_eq!(archived.status, TournamentStatus::Cancelled);
        assert_eq!(archived.miss_count, 2);

        // Archived records are no longer counted as misses.
        let third = sync(&r, &store, "fed", &only_lake, at(6)).await;
        assert!(third.stale.is_empty());
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_natural_key_prefers_most_recently_seen() {
        let listed = candidate(None, "City Open", date(5, 1));
        let mut older = TournamentRecord::from_candidate(&listed, "fed", at(1));
        older.id = Uuid::from_u128(1);
        let mut newer = TournamentRecord::from_candidate(&listed, "fed", at(1));
        newer.id = Uuid::from_u128(2);
        newer.last_seen_at = at(3);
        let store = MemoryGateway::with_records([older.clone(), newer.clone()]);

        let batch = reconciler(3)
            .reconcile("fed", &[candidate(None, "City Open", date(5, 1))], &store, at(4))
            .await
            .unwrap();

        assert_eq!(batch.conflicts.len(), 1);
        let conflict = &batch.conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::AmbiguousNaturalKey);
        assert_eq!(conflict.chosen_id, newer.id);
        assert_eq!(conflict.candidate_ids, vec![older.id, newer.id]);
        assert_eq!(batch.noops.len() + batch.updates.len(), 1);
        // The unmatched twin counts as missed by this source.
        assert_eq!(batch.stale.len(), 1);
        assert_eq!(batch.stale[0].record.id, older.id);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_collapse_into_one_record() {
        let store = MemoryGateway::new();
        let batch = reconciler(3)
            .reconcile(
                "fed",
                &[
                    candidate(None, "City Open", date(5, 1)),
                    candidate(None, "CITY OPEN ", date(5, 1)),
                    candidate(Some("X"), "Other", date(7, 1)),
                    candidate(Some("X"), "Other renamed", date(7, 1)),
                ],
                &store,
                at(1),
            )
            .await
            .unwrap();

        assert_eq!(batch.inserts.len(), 2);
        assert_eq!(batch.conflicts.len(), 2);
        assert!(batch
            .conflicts
            .iter()
            .all(|c| c.kind == ConflictKind::DuplicateInBatch));
    }

    #[tokio::test]
    async fn tolerant_policy_matches_nearby_dates_and_similar_names() {
        let store = MemoryGateway::new();
        let r = Reconciler::new(ReconcilePolicy {
            stale_miss_threshold: 3,
            match_policy: MatchPolicy {
                date_tolerance_days: 1,
                name_similarity: Some(0.9),
            },
        });
        let federation = [candidate(None, "City Open 2030", date(5, 1))];
        sync(&r, &store, "fed", &federation, at(1)).await;
        let fide = [candidate(None, "City Open 2030.", date(5, 2))];
        let batch = sync(&r, &store, "fide", &fide, at(1)).await;
        assert!(batch.inserts.is_empty());
        assert_eq!(store.snapshot().await.len(), 1);

        let strict = reconciler(3);
        let batch = strict
            .reconcile("fide", &[candidate(None, "City Open 2030.", date(5, 2))], &store, at(2))
            .await
            .unwrap();
        assert_eq!(batch.inserts.len(), 1);
    }

    #[tokio::test]
    async fn ids_from_different_sources_still_merge_on_natural_key() {
        let store = MemoryGateway::new();
        let r = reconciler(3);
        let fide = [candidate(Some("FIDE123"), "City Open", date(5, 1))];
        sync(&r, &store, "fide", &fide, at(1)).await;

        let mut federation = candidate(Some("rcf:51"), "CITY OPEN", date(5, 1));
        federation.location = "berlin, germany".to_string();
        let batch = sync(&r, &store, "federation", &[federation.clone()], at(1)).await;

        assert!(batch.inserts.is_empty());
        assert_eq!(batch.updates.len(), 1);
        let stored = store.snapshot().await;
        assert_eq!(stored.len(), 1);
        let merged = &stored[0];
        assert_eq!(merged.external_id.as_deref(), Some("FIDE123"));
        assert_eq!(merged.source_id, "fide");
        assert_eq!(merged.name, "City Open");
        assert_eq!(
            merged.source_ids.get("federation").map(String::as_str),
            Some("rcf:51")
        );

        // Later federation runs resolve straight through the federation id.
        federation.name = "City Open (renamed)".to_string();
        let batch = sync(&r, &store, "federation", &[federation], at(2)).await;
        assert_eq!(batch.noops.len(), 1);
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn same_source_id_mismatch_blocks_the_merge() {
        let store = MemoryGateway::new();
        let r = reconciler(3);
        let first = [candidate(Some("rcf:51"), "City Open", date(5, 1))];
        sync(&r, &store, "federation", &first, at(1)).await;

        let other = [candidate(Some("rcf:52"), "City Open", date(5, 1))];
        let batch = sync(&r, &store, "federation", &other, at(2)).await;
        assert_eq!(batch.inserts.len(), 1);
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn in_batch_duplicate_contributes_its_external_id() {
        let store = MemoryGateway::new();
        let batch = reconciler(3)
            .reconcile(
                "fide",
                &[
                    candidate(None, "City Open", date(5, 1)),
                    candidate(Some("FIDE123"), "City Open", date(5, 1)),
                ],
                &store,
                at(1),
            )
            .await
            .unwrap();

        assert_eq!(batch.inserts.len(), 1);
        assert_eq!(batch.conflicts.len(), 1);
        let record = &batch.inserts[0];
        assert_eq!(record.external_id.as_deref(), Some("FIDE123"));
        assert_eq!(record.source_ids.get("fide").map(String::as_str), Some("FIDE123"));
        assert_eq!(record.content_hash, record.compute_content_hash());

        store.commit(&batch).await.unwrap();
        assert!(store.find_by_external_id("FIDE123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_record_revives_once_back_below_threshold() {
        let store = MemoryGateway::new();
        let r = reconciler(2);
        let city = candidate(None, "City Open", date(5, 1));
        let lake = candidate(None, "Lake Cup", date(6, 1));
        sync(&r, &store, "fed", &[city.clone(), lake.clone()], at(1)).await;
        sync(&r, &store, "fed", &[lake.clone()], at(2)).await;
        sync(&r, &store, "fed", &[lake.clone()], at(3)).await;
        let id = store
            .snapshot()
            .await
            .into_iter()
            .find(|t| t.name == "City Open")
            .unwrap()
            .id;
        assert_eq!(store.get(id).await.unwrap().status, TournamentStatus::Cancelled);

        let batch = sync(&r, &store, "fed", &[city, lake], at(4)).await;
        assert!(batch.updates.iter().any(|t| t.id == id));
        let revived = store.get(id).await.unwrap();
        assert_eq!(revived.status, TournamentStatus::Scheduled);
        assert_eq!(revived.miss_count, 0);
    }

    #[tokio::test]
    async fn cancelled_record_stays_cancelled_while_another_claim_is_stale() {
        let store = MemoryGateway::new();
        let r = reconciler(2);
        let city = candidate(None, "City Open", date(5, 1));
        let lake = candidate(None, "Lake Cup", date(6, 1));
        sync(&r, &store, "fed", &[city.clone()], at(1)).await;
        sync(&r, &store, "fide", &[city.clone(), lake.clone()], at(1)).await;
        assert_eq!(store.snapshot().await.len(), 2);

        sync(&r, &store, "fide", &[lake.clone()], at(2)).await;
        sync(&r, &store, "fide", &[lake], at(3)).await;
        let id = store
            .snapshot()
            .await
            .into_iter()
            .find(|t| t.name == "City Open")
            .unwrap()
            .id;
        assert_eq!(store.get(id).await.unwrap().status, TournamentStatus::Cancelled);

        // The other claimant still lists it, but fide's streak is at the threshold.
        let batch = sync(&r, &store, "fed", &[city], at(4)).await;
        assert!(batch.updates.is_empty());
        let record = store.get(id).await.unwrap();
        assert_eq!(record.status, TournamentStatus::Cancelled);
        assert_eq!(record.claims.get("fide"), Some(&2));
        assert_eq!(record.claims.get("fed"), Some(&0));
        assert_eq!(record.miss_count, 2);
    }

    #[test]
    fn exact_policy_requires_identical_keys() {
        let policy = MatchPolicy::default();
        let a = NaturalKey::new("City Open", date(5, 1), "Berlin");
        assert!(policy.is_exact());
        assert!(policy.keys_match(&a, &NaturalKey::new("city  open", date(5, 1), "BERLIN")));
        assert!(!policy.keys_match(&a, &NaturalKey::new("City Open", date(5, 2), "Berlin")));
        assert!(!policy.keys_match(&a, &NaturalKey::new("City Open", date(5, 1), "Bonn")));
    }
}
