//! Core domain model for RVH: parse jobs, raw/canonical review records and fingerprints.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rvh-core";

/// Author placeholder for records whose author is blank after trimming.
pub const UNKNOWN_AUTHOR: &str = "unknown";

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

const FINGERPRINT_DELIMITER: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(JobStateError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateError {
    #[error("job {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("unknown job status {0:?}")]
    UnknownStatus(String),
}

/// One asynchronous parse run against a single source key.
///
/// All mutation goes through the `mark_*` transitions, which enforce
/// `QUEUED -> RUNNING -> {SUCCESS, FAILED}` plus the guard-skip edge
/// `QUEUED -> SUCCESS`, and keep timestamps non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseJob {
    pub id: Uuid,
    pub source_key: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_reviews: Option<u32>,
    pub error_message: Option<String>,
}

impl ParseJob {
    pub fn queued(source_key: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_key: source_key.into(),
            status: JobStatus::Queued,
            created_at,
            started_at: None,
            finished_at: None,
            created_reviews: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), JobStateError> {
        self.expect_status(&[JobStatus::Queued], JobStatus::Running)?;
        self.started_at = Some(self.not_before(at));
        self.status = JobStatus::Running;
        Ok(())
    }

    pub fn mark_succeeded(&mut self, at: DateTime<Utc>, created: u32) -> Result<(), JobStateError> {
        self.expect_status(&[JobStatus::Running], JobStatus::Success)?;
        self.finished_at = Some(self.not_before(at));
        self.created_reviews = Some(created);
        self.error_message = None;
        self.status = JobStatus::Success;
        Ok(())
    }

    /// Guard contention: another run already owns the source, so this one
    /// finishes as a successful no-op.
    pub fn mark_skipped(
        &mut self,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Result<(), JobStateError> {
        self.expect_status(&[JobStatus::Queued], JobStatus::Success)?;
        self.finished_at = Some(self.not_before(at));
        self.created_reviews = Some(0);
        self.error_message = Some(reason.into());
        self.status = JobStatus::Success;
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        at: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Result<(), JobStateError> {
        self.expect_status(&[JobStatus::Queued, JobStatus::Running], JobStatus::Failed)?;
        self.finished_at = Some(self.not_before(at));
        self.error_message = Some(message.into());
        self.status = JobStatus::Failed;
        Ok(())
    }

    fn expect_status(&self, allowed: &[JobStatus], to: JobStatus) -> Result<(), JobStateError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(JobStateError::IllegalTransition {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }

    fn not_before(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let latest = self.started_at.unwrap_or(self.created_at);
        at.max(latest)
    }
}

/// Source-specific record as returned by an adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub author: String,
    pub rating: u8,
    pub text: String,
    pub occurred_on: NaiveDate,
}

impl RawRecord {
    pub fn new(
        author: impl Into<String>,
        rating: u8,
        text: impl Into<String>,
        occurred_on: NaiveDate,
    ) -> Self {
        Self {
            author: author.into(),
            rating,
            text: text.into(),
            occurred_on,
        }
    }

    pub fn canonicalize(&self) -> CanonicalRecord {
        let author = self.author.trim();
        CanonicalRecord {
            author: if author.is_empty() {
                UNKNOWN_AUTHOR.to_string()
            } else {
                author.to_string()
            },
            text: self.text.trim().to_string(),
            date: self.occurred_on.format("%Y-%m-%d").to_string(),
            occurred_on: self.occurred_on,
            rating: self.rating,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRecord {
    pub author: String,
    pub text: String,
    /// ISO `YYYY-MM-DD` rendering of `occurred_on`; this is what gets hashed.
    pub date: String,
    pub occurred_on: NaiveDate,
    pub rating: u8,
}

impl CanonicalRecord {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.author, &self.date, self.rating, &self.text)
    }

    pub fn into_stored(
        self,
        source_key: impl Into<String>,
        fingerprint: String,
        fetched_at: DateTime<Utc>,
    ) -> StoredReview {
        StoredReview {
            source_key: source_key.into(),
            author: self.author,
            rating: self.rating,
            text: self.text,
            occurred_on: self.occurred_on,
            fetched_at,
            fingerprint,
        }
    }
}

/// SHA-256 over `author|date|rating|text`, lowercase hex.
pub fn fingerprint(author: &str, date: &str, rating: u8, text: &str) -> String {
    let material = format!(
        "{author}{d}{date}{d}{rating}{d}{text}",
        d = FINGERPRINT_DELIMITER
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persisted review. `(source_key, fingerprint)` is unique in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReview {
    pub source_key: String,
    pub author: String,
    pub rating: u8,
    pub text: String,
    pub occurred_on: NaiveDate,
    pub fetched_at: DateTime<Utc>,
    pub fingerprint: String,
}

/// A source the periodic trigger re-runs while `enabled`. The url is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSource {
    pub id: i64,
    pub url: String,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, h, 0, 0).single().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 20).unwrap()
    }

    #[test]
    fn fingerprint_is_stable_sha256_hex() {
        let fp = fingerprint("alice", "2025-12-20", 5, "great");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(fp, fingerprint("alice", "2025-12-20", 5, "great"));
        assert_eq!(
            fingerprint("a", "b", 1, "c"),
            "4cb551dd97355e30b2c93314884a106820fe6f548133ddc6e0196f25f0ef28f6"
        );
    }

    #[test]
    fn fingerprint_distinguishes_every_field() {
        let base = fingerprint("alice", "2025-12-20", 5, "great");
        assert_ne!(base, fingerprint("bob", "2025-12-20", 5, "great"));
        assert_ne!(base, fingerprint("alice", "2025-12-21", 5, "great"));
        assert_ne!(base, fingerprint("alice", "2025-12-20", 4, "great"));
        assert_ne!(base, fingerprint("alice", "2025-12-20", 5, "good"));
    }

    #[test]
    fn canonicalize_trims_and_substitutes_placeholder() {
        let raw = RawRecord::new("   ", 3, "  fine product \n", date());
        let canonical = raw.canonicalize();
        assert_eq!(canonical.author, UNKNOWN_AUTHOR);
        assert_eq!(canonical.text, "fine product");
        assert_eq!(canonical.date, "2025-12-20");
        assert_eq!(canonical.rating, 3);
    }

    #[test]
    fn whitespace_variants_share_a_fingerprint() {
        let a = RawRecord::new(" alice ", 5, "great ", date()).canonicalize();
        let b = RawRecord::new("alice", 5, "  great", date()).canonicalize();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(
            a.fingerprint(),
            "a6358ea2bacd7621d5a06057f0f99e85f0d90bde1fcb2489bcc23411fa039dbf"
        );
    }

    #[test]
    fn job_happy_path_transitions() {
        let mut job = ParseJob::queued("https://x/a", ts(10));
        assert_eq!(job.status, JobStatus::Queued);
        job.mark_running(ts(11)).unwrap();
        assert_eq!(job.started_at, Some(ts(11)));
        job.mark_succeeded(ts(12), 15).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.created_reviews, Some(15));
        assert_eq!(job.finished_at, Some(ts(12)));
        assert!(job.error_message.is_none());
    }

    #[test]
    fn terminal_job_rejects_further_transitions() {
        let mut job = ParseJob::queued("https://x/a", ts(10));
        job.mark_running(ts(11)).unwrap();
        job.mark_failed(ts(12), "boom").unwrap();
        let before = job.clone();
        assert!(matches!(
            job.mark_succeeded(ts(13), 1),
            Err(JobStateError::IllegalTransition { .. })
        ));
        assert!(job.mark_failed(ts(13), "again").is_err());
        assert!(job.mark_running(ts(13)).is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn skip_only_from_queued() {
        let mut job = ParseJob::queued("steam:570", ts(10));
        job.mark_skipped(ts(10), "busy").unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.created_reviews, Some(0));
        assert_eq!(job.error_message.as_deref(), Some("busy"));
        assert!(job.started_at.is_none());

        let mut running = ParseJob::queued("steam:570", ts(10));
        running.mark_running(ts(10)).unwrap();
        assert!(running.mark_skipped(ts(11), "busy").is_err());
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let mut job = ParseJob::queued("https://x/a", ts(10));
        job.mark_running(ts(10) - Duration::seconds(5)).unwrap();
        assert_eq!(job.started_at, Some(ts(10)));
        job.mark_failed(ts(9), "clock skew").unwrap();
        assert_eq!(job.finished_at, Some(ts(10)));
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&JobStatus::Running).unwrap(),
            "\"RUNNING\""
        );
        assert!("DONE".parse::<JobStatus>().is_err());
    }
}
