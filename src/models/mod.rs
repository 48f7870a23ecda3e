use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::VoteError;

pub const MEASURE_MIN_CHARS: usize = 3;
pub const MEASURE_MAX_CHARS: usize = 255;
pub const OPTION_MAX_CHARS: usize = 64;

lazy_static! {
    static ref HTML_TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub id: String,
    pub measure: String,
    pub options: Vec<BallotOption>,
    pub allow_write_in: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotOption {
    pub id: i64,
    pub text: String,
    pub is_write_in: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotStatus {
    Pending,
    Active,
    Ended,
}

impl BallotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BallotStatus::Pending => "pending",
            BallotStatus::Active => "active",
            BallotStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for BallotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Ballot {
    /// Status of the ballot at `now`, derived purely from its time bounds.
    pub fn status_at(&self, now: DateTime<Utc>) -> BallotStatus {
        if let Some(start) = self.start_time {
            if now < start {
                return BallotStatus::Pending;
            }
        }
        if let Some(end) = self.end_time {
            if now > end {
                return BallotStatus::Ended;
            }
        }
        BallotStatus::Active
    }

    pub fn status(&self) -> BallotStatus {
        self.status_at(Utc::now())
    }

    /// Status plus a short human-readable description, e.g. "ends in 2 hours".
    pub fn describe_status(&self, now: DateTime<Utc>) -> (BallotStatus, String) {
        let status = self.status_at(now);
        let text = match status {
            BallotStatus::Pending => match self.start_time {
                Some(start) => format!("starts in {}", format_time_delta(start - now)),
                None => "pending".to_string(),
            },
            BallotStatus::Ended => "voting closed".to_string(),
            BallotStatus::Active => match self.end_time {
                Some(end) => format!("ends in {}", format_time_delta(end - now)),
                None => "voting open".to_string(),
            },
        };
        (status, text)
    }

    pub fn option_by_id(&self, option_id: i64) -> Option<&BallotOption> {
        self.options.iter().find(|option| option.id == option_id)
    }

    pub fn option_by_text(&self, text: &str) -> Option<&BallotOption> {
        self.options.iter().find(|option| option.text == text)
    }

    fn option_by_text_ignore_case(&self, text: &str) -> Option<&BallotOption> {
        let wanted = text.to_lowercase();
        self.options
            .iter()
            .find(|option| option.text.to_lowercase() == wanted)
    }

    /// Resolves a selector against the current option set. A write-in that
    /// matches an existing option (ignoring case) resolves to that option.
    pub fn resolve(&self, selector: &OptionSelector) -> Result<Resolution, VoteError> {
        match selector {
            OptionSelector::Id(id) => self
                .option_by_id(*id)
                .map(|option| Resolution::Existing(option.id))
                .ok_or_else(|| {
                    VoteError::OptionNotAllowed(format!("option {} is not part of this ballot", id))
                }),
            OptionSelector::Text(text) => {
                let text = text.trim();
                if let Some(option) = self.option_by_text(text) {
                    return Ok(Resolution::Existing(option.id));
                }
                self.resolve_write_in(text)
            }
            OptionSelector::WriteIn(text) => self.resolve_write_in(text),
        }
    }

    fn resolve_write_in(&self, raw: &str) -> Result<Resolution, VoteError> {
        if !self.allow_write_in {
            return Err(VoteError::OptionNotAllowed(
                "write-in votes are not allowed for this ballot".to_string(),
            ));
        }
        let text = sanitize_write_in(raw);
        let len = text.chars().count();
        if len == 0 || len > OPTION_MAX_CHARS {
            return Err(VoteError::OptionNotAllowed(format!(
                "write-in must be between 1 and {} characters",
                OPTION_MAX_CHARS
            )));
        }
        match self.option_by_text_ignore_case(&text) {
            Some(option) => Ok(Resolution::Existing(option.id)),
            None => Ok(Resolution::NewWriteIn(text)),
        }
    }
}

/// Outcome of resolving an [`OptionSelector`] against a ballot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing(i64),
    NewWriteIn(String),
}

/// How a voter names the option they are voting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionSelector {
    Id(i64),
    Text(String),
    WriteIn(String),
}

impl From<&str> for OptionSelector {
    fn from(text: &str) -> Self {
        OptionSelector::Text(text.to_string())
    }
}

impl From<i64> for OptionSelector {
    fn from(id: i64) -> Self {
        OptionSelector::Id(id)
    }
}

/// A ballot as requested by its creator, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BallotDraft {
    pub measure: String,
    pub options: Vec<String>,
    pub allow_write_in: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BallotDraft {
    pub fn new<S: Into<String>>(measure: S, options: Vec<String>) -> Self {
        Self {
            measure: measure.into(),
            options,
            allow_write_in: false,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_write_ins(mut self, allow: bool) -> Self {
        self.allow_write_in = allow;
        self
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn ending_at(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Trims and checks the draft, returning the normalized copy.
    pub fn validate(&self) -> Result<BallotDraft, VoteError> {
        let measure = self.measure.trim().to_string();
        let measure_len = measure.chars().count();
        if measure_len < MEASURE_MIN_CHARS || measure_len > MEASURE_MAX_CHARS {
            return Err(VoteError::InvalidBallot(format!(
                "measure must be between {} and {} characters",
                MEASURE_MIN_CHARS, MEASURE_MAX_CHARS
            )));
        }

        let options: Vec<String> = self
            .options
            .iter()
            .map(|option| option.trim().to_string())
            .collect();

        // With write-ins a single predefined option is enough
        let min_options = if self.allow_write_in { 1 } else { 2 };
        if options.len() < min_options {
            return Err(VoteError::InvalidBallot(format!(
                "at least {} options required when write-ins are {}",
                min_options,
                if self.allow_write_in { "enabled" } else { "disabled" }
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for option in &options {
            let len = option.chars().count();
            if len == 0 || len > OPTION_MAX_CHARS {
                return Err(VoteError::InvalidBallot(format!(
                    "options must be between 1 and {} characters",
                    OPTION_MAX_CHARS
                )));
            }
            if !seen.insert(option.to_lowercase()) {
                return Err(VoteError::InvalidBallot(format!("duplicate option '{}'", option)));
            }
        }

        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end <= start {
                return Err(VoteError::InvalidBallot(
                    "end time must be after start time".to_string(),
                ));
            }
        }

        Ok(BallotDraft {
            measure,
            options,
            allow_write_in: self.allow_write_in,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyEntry {
    pub option_id: i64,
    pub option: String,
    pub count: u64,
    pub is_write_in: bool,
}

/// Per-option counts for one ballot at a point in time.
///
/// `total_votes` only ever grows for a ballot, so it is also used to order snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub ballot_id: String,
    pub entries: Vec<TallyEntry>,
    pub total_votes: u64,
}

impl TallySnapshot {
    pub fn from_counts(ballot: &Ballot, counts: &HashMap<i64, u64>) -> Self {
        let entries: Vec<TallyEntry> = ballot
            .options
            .iter()
            .map(|option| TallyEntry {
                option_id: option.id,
                option: option.text.clone(),
                count: counts.get(&option.id).copied().unwrap_or(0),
                is_write_in: option.is_write_in,
            })
            .collect();
        let total_votes = entries.iter().map(|entry| entry.count).sum();
        Self {
            ballot_id: ballot.id.clone(),
            entries,
            total_votes,
        }
    }

    pub fn count_for(&self, option: &str) -> u64 {
        self.entries
            .iter()
            .find(|entry| entry.option == option)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }
}

pub fn new_ballot_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Strips markup from voter-supplied text.
pub fn sanitize_write_in(text: &str) -> String {
    HTML_TAG.replace_all(text, "").trim().to_string()
}

/// Coarse human rendering of a duration: "45 seconds", "5 minutes", "3 hours", "2 days".
pub fn format_time_delta(diff: Duration) -> String {
    let seconds = diff.num_seconds().max(0);
    if seconds < 60 {
        return format!("{} seconds", seconds);
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{} minutes", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} hours", hours);
    }
    format!("{} days", hours / 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(allow_write_in: bool) -> Ballot {
        Ballot {
            id: new_ballot_id(),
            measure: "Lunch?".to_string(),
            options: vec![
                BallotOption { id: 1, text: "Yes".to_string(), is_write_in: false },
                BallotOption { id: 2, text: "No".to_string(), is_write_in: false },
            ],
            allow_write_in,
            start_time: None,
            end_time: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn format_time_delta_buckets() {
        assert_eq!(format_time_delta(Duration::seconds(45)), "45 seconds");
        assert_eq!(format_time_delta(Duration::minutes(5)), "5 minutes");
        assert_eq!(format_time_delta(Duration::seconds(119)), "1 minutes");
        assert_eq!(format_time_delta(Duration::hours(3)), "3 hours");
        assert_eq!(format_time_delta(Duration::minutes(119)), "1 hours");
        assert_eq!(format_time_delta(Duration::days(2)), "2 days");
        assert_eq!(format_time_delta(Duration::hours(47)), "1 days");
        assert_eq!(format_time_delta(Duration::days(10)), "10 days");
    }

    #[test]
    fn status_follows_time_bounds() {
        let now = Utc::now();
        let mut b = ballot(false);
        assert_eq!(b.describe_status(now), (BallotStatus::Active, "voting open".to_string()));

        b.start_time = Some(now + Duration::minutes(5) + Duration::seconds(1));
        assert_eq!(
            b.describe_status(now),
            (BallotStatus::Pending, "starts in 5 minutes".to_string())
        );

        b.start_time = Some(now - Duration::minutes(1));
        b.end_time = Some(now + Duration::hours(2) + Duration::seconds(1));
        assert_eq!(b.describe_status(now), (BallotStatus::Active, "ends in 2 hours".to_string()));

        b.end_time = Some(now - Duration::seconds(1));
        assert_eq!(b.describe_status(now), (BallotStatus::Ended, "voting closed".to_string()));
    }

    #[test]
    fn resolve_existing_and_write_ins() {
        let b = ballot(true);
        assert_eq!(b.resolve(&"Yes".into()).unwrap(), Resolution::Existing(1));
        assert_eq!(b.resolve(&OptionSelector::Id(2)).unwrap(), Resolution::Existing(2));
        assert_eq!(
            b.resolve(&OptionSelector::WriteIn("<b>yes</b>".to_string())).unwrap(),
            Resolution::Existing(1)
        );
        assert_eq!(
            b.resolve(&"Maybe".into()).unwrap(),
            Resolution::NewWriteIn("Maybe".to_string())
        );
        assert!(matches!(
            b.resolve(&OptionSelector::WriteIn("<i></i>".to_string())),
            Err(VoteError::OptionNotAllowed(_))
        ));
    }

    #[test]
    fn resolve_rejects_unknown_without_write_ins() {
        let b = ballot(false);
        assert!(matches!(b.resolve(&"Maybe".into()), Err(VoteError::OptionNotAllowed(_))));
        assert!(matches!(b.resolve(&OptionSelector::Id(99)), Err(VoteError::OptionNotAllowed(_))));
    }

    #[test]
    fn draft_validation() {
        let ok = BallotDraft::new("  Best editor  ", vec![" vim ".to_string(), "emacs".to_string()]);
        let normalized = ok.validate().unwrap();
        assert_eq!(normalized.measure, "Best editor");
        assert_eq!(normalized.options, vec!["vim".to_string(), "emacs".to_string()]);

        let single = BallotDraft::new("Best editor", vec!["vim".to_string()]);
        assert!(single.validate().is_err());
        assert!(single.clone().with_write_ins(true).validate().is_ok());

        let short = BallotDraft::new("no", vec!["a".to_string(), "b".to_string()]);
        assert!(short.validate().is_err());

        let dup = BallotDraft::new("Pick one", vec!["A".to_string(), "a".to_string()]);
        assert!(dup.validate().is_err());

        let now = Utc::now();
        let backwards = BallotDraft::new("Pick one", vec!["A".to_string(), "B".to_string()])
            .starting_at(now)
            .ending_at(now - Duration::minutes(1));
        assert!(backwards.validate().is_err());
    }

    #[test]
    fn snapshot_keeps_option_order_and_zero_counts() {
        let b = ballot(false);
        let mut counts = HashMap::new();
        counts.insert(2, 4);
        let snapshot = TallySnapshot::from_counts(&b, &counts);
        assert_eq!(snapshot.entries[0].option, "Yes");
        assert_eq!(snapshot.entries[0].count, 0);
        assert_eq!(snapshot.count_for("No"), 4);
        assert_eq!(snapshot.total_votes, 4);
    }
}
