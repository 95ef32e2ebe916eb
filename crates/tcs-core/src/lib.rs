//! Core domain model and batch contracts for tournament calendar sync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcs-core";

/// Which extraction rules apply to a source's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Fide,
    Federation,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Fide => f.write_str("fide"),
            SourceKind::Federation => f.write_str("federation"),
        }
    }
}

/// One configured external origin of tournament data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Overrides the pipeline-wide fetch timeout for this source only.
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

/// Source bytes exactly as fetched; parsers own all interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_id: String,
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TournamentStatus {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
}

impl TournamentStatus {
    /// Calendar status of a live (non-archived) tournament on `today`.
    pub fn for_dates(start_date: NaiveDate, end_date: NaiveDate, today: NaiveDate) -> Self {
        if today < start_date {
            TournamentStatus::Scheduled
        } else if today > end_date {
            TournamentStatus::Completed
        } else {
            TournamentStatus::Ongoing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TournamentStatus::Scheduled => "Scheduled",
            TournamentStatus::Ongoing => "Ongoing",
            TournamentStatus::Completed => "Completed",
            TournamentStatus::Cancelled => "Cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Scheduled" => Some(TournamentStatus::Scheduled),
            "Ongoing" => Some(TournamentStatus::Ongoing),
            "Completed" => Some(TournamentStatus::Completed),
            "Cancelled" => Some(TournamentStatus::Cancelled),
            _ => None,
        }
    }
}

/// Parsed/pre-normalized handoff contract from parsers into the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTournament {
    pub external_id: Option<String>,
    pub name: String,
    pub location: String,
    pub category: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub source_url: String,
}

impl ParsedTournament {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.name, self.start_date, &self.location)
    }
}

/// Derived identity for records without an authoritative external id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub name: String,
    pub start_date: NaiveDate,
    pub location: String,
}

impl NaturalKey {
    pub fn new(name: &str, start_date: NaiveDate, location: &str) -> Self {
        Self {
            name: fold_text(name),
            start_date,
            location: fold_text(location),
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.name, self.start_date, self.location)
    }
}

/// Trim and collapse every whitespace run into a single space.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-fold, strip diacritics and collapse whitespace.
pub fn fold_text(input: &str) -> String {
    let stripped = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();
    normalize_whitespace(&stripped)
}

/// Canonical persisted tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentRecord {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub name: String,
    pub location: String,
    pub category: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: TournamentStatus,
    /// Source whose field values this record carries.
    pub source_id: String,
    pub source_url: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub miss_count: u32,
    /// Consecutive misses per source that has ever matched this record.
    pub claims: BTreeMap<String, u32>,
    /// External id each source reported for this tournament, keyed by source id.
    #[serde(default)]
    pub source_ids: BTreeMap<String, String>,
}

impl TournamentRecord {
    /// New record for a candidate no existing record matched.
    pub fn from_candidate(
        candidate: &ParsedTournament,
        source_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Self {
        let mut claims = BTreeMap::new();
        claims.insert(source_id.to_string(), 0);
        let mut source_ids = BTreeMap::new();
        if let Some(external_id) = &candidate.external_id {
            source_ids.insert(source_id.to_string(), external_id.clone());
        }
        let mut record = Self {
            id: Uuid::new_v4(),
            external_id: candidate.external_id.clone(),
            name: candidate.name.clone(),
            location: candidate.location.clone(),
            category: candidate.category.clone(),
            start_date: candidate.start_date,
            end_date: candidate.end_date,
            status: TournamentStatus::for_dates(
                candidate.start_date,
                candidate.end_date,
                seen_at.date_naive(),
            ),
            source_id: source_id.to_string(),
            source_url: candidate.source_url.clone(),
            content_hash: String::new(),
            created_at: seen_at,
            updated_at: seen_at,
            last_seen_at: seen_at,
            miss_count: 0,
            claims,
            source_ids,
        };
        record.content_hash = record.compute_content_hash();
        record
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey::new(&self.name, self.start_date, &self.location)
    }

    /// Whether `external_id` is this record's canonical id or one a source reported.
    pub fn has_external_id(&self, external_id: &str) -> bool {
        self.external_id.as_deref() == Some(external_id)
            || self.source_ids.values().any(|id| id == external_id)
    }

    /// Every distinct external id known for this record.
    pub fn external_ids(&self) -> BTreeSet<&str> {
        self.external_id
            .as_deref()
            .into_iter()
            .chain(self.source_ids.values().map(String::as_str))
            .collect()
    }

    pub fn is_active(&self) -> bool {
        self.status != TournamentStatus::Cancelled
    }

    /// Copy the mutable descriptive fields from a candidate.
    pub fn apply_candidate(&mut self, candidate: &ParsedTournament) {
        if candidate.external_id.is_some() {
            self.external_id = candidate.external_id.clone();
        }
        self.name = candidate.name.clone();
        self.location = candidate.location.clone();
        self.category = candidate.category.clone();
        self.start_date = candidate.start_date;
        self.end_date = candidate.end_date;
        self.source_url = candidate.source_url.clone();
    }

    /// SHA-256 over the mutable fields, used for cheap change detection.
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.external_id.as_deref().unwrap_or(""),
            &self.name,
            &self.location,
            &self.category,
            &self.start_date.to_string(),
            &self.end_date.to_string(),
            &self.source_url,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }

    /// `miss_count` is the worst consecutive-miss streak across claiming sources.
    pub fn refresh_miss_count(&mut self) {
        self.miss_count = self.claims.values().copied().max().unwrap_or(0);
    }

    /// Status after a sighting or miss: archived at the threshold, otherwise date-derived.
    pub fn settle_status(&mut self, stale_miss_threshold: u32, today: NaiveDate) {
        self.status = if self.miss_count >= stale_miss_threshold {
            TournamentStatus::Cancelled
        } else {
            TournamentStatus::for_dates(self.start_date, self.end_date, today)
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Several stored records share the candidate's natural key.
    AmbiguousNaturalKey,
    /// The candidate resolves to a record already touched in this batch.
    DuplicateInBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConflict {
    pub kind: ConflictKind,
    pub natural_key: NaturalKey,
    pub chosen_id: Uuid,
    pub candidate_ids: Vec<Uuid>,
}

/// Record whose miss counter moved because its source no longer lists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRecord {
    pub record: TournamentRecord,
    /// True when this miss pushed the record to `Cancelled`.
    pub archived: bool,
}

/// Complete write set for one source's batch, applied in one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileBatch {
    pub source_id: String,
    pub inserts: Vec<TournamentRecord>,
    pub updates: Vec<TournamentRecord>,
    pub noops: Vec<TournamentRecord>,
    pub stale: Vec<StaleRecord>,
    pub conflicts: Vec<ReconcileConflict>,
}

impl ReconcileBatch {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn archived_count(&self) -> usize {
        self.stale.iter().filter(|s| s.archived).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitResult {
    pub inserted: usize,
    pub updated: usize,
    pub noop: usize,
    pub archived: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn candidate() -> ParsedTournament {
        ParsedTournament {
            external_id: Some("FIDE123".into()),
            name: "City Open".into(),
            location: "Berlin".into(),
            category: "Open".into(),
            start_date: date(2030, 5, 1),
            end_date: date(2030, 5, 9),
            source_url: "https://calendar.fide.com/event/123".into(),
        }
    }

    #[test]
    fn fold_text_strips_case_diacritics_and_spacing() {
        assert_eq!(fold_text("  Café   de  la PAIX "), "cafe de la paix");
        assert_eq!(fold_text("Zürich\tOpen"), "zurich open");
        assert_eq!(fold_text("Москва"), "москва");
    }

    #[test]
    fn natural_key_ignores_textual_noise() {
        let a = NaturalKey::new("City  Open", date(2030, 5, 1), "BERLIN");
        let b = NaturalKey::new("city open", date(2030, 5, 1), " Berlin ");
        let c = NaturalKey::new("city open", date(2030, 5, 2), "Berlin");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn content_hash_tracks_mutable_fields_only() {
        let seen = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().unwrap();
        let first = TournamentRecord::from_candidate(&candidate(), "fide", seen);
        let mut second = first.clone();
        second.last_seen_at = seen + chrono::Duration::days(3);
        second.miss_count = 2;
        assert_eq!(first.content_hash, second.compute_content_hash());

        second.location = "Hamburg".into();
        assert_ne!(first.content_hash, second.compute_content_hash());
    }

    #[test]
    fn status_follows_calendar_dates() {
        let start = date(2030, 5, 1);
        let end = date(2030, 5, 9);
        assert_eq!(
            TournamentStatus::for_dates(start, end, date(2030, 4, 30)),
            TournamentStatus::Scheduled
        );
        assert_eq!(
            TournamentStatus::for_dates(start, end, date(2030, 5, 9)),
            TournamentStatus::Ongoing
        );
        assert_eq!(
            TournamentStatus::for_dates(start, end, date(2030, 5, 10)),
            TournamentStatus::Completed
        );
    }

    #[test]
    fn source_ids_cover_every_reported_external_id() {
        let seen = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().unwrap();
        let mut record = TournamentRecord::from_candidate(&candidate(), "fide", seen);
        assert_eq!(record.source_ids.get("fide").map(String::as_str), Some("FIDE123"));

        record.source_ids.insert("federation".into(), "rcf:51".into());
        assert!(record.has_external_id("FIDE123"));
        assert!(record.has_external_id("rcf:51"));
        assert!(!record.has_external_id("rcf:52"));
        assert_eq!(
            record.external_ids().into_iter().collect::<Vec<_>>(),
            vec!["FIDE123", "rcf:51"]
        );
    }

    #[test]
    fn miss_count_is_worst_claim_and_settles_status() {
        let seen = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().unwrap();
        let mut record = TournamentRecord::from_candidate(&candidate(), "fide", seen);
        record.claims.insert("federation".into(), 2);
        record.refresh_miss_count();
        assert_eq!(record.miss_count, 2);

        record.settle_status(2, seen.date_naive());
        assert_eq!(record.status, TournamentStatus::Cancelled);

        record.claims.insert("federation".into(), 0);
        record.refresh_miss_count();
        record.settle_status(2, seen.date_naive());
        assert_eq!(record.status, TournamentStatus::Scheduled);
    }
}
