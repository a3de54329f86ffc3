use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// A validated ballot choice. Construct through
/// [`validate_option_id`](crate::validation::validate_option_id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionId(String);

impl OptionId {
    pub(crate) fn new_unchecked(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound vote as published by the ingress. `option_id` is untrusted
/// until the processor resolves it against the configured options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteEvent {
    pub option_id: String,
    pub voter_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

impl VoteEvent {
    pub fn new(option_id: impl Into<String>, voter_token: impl Into<String>) -> Self {
        Self {
            option_id: option_id.into(),
            voter_token: voter_token.into(),
            submitted_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A persisted vote. Rows are append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub id: i64,
    pub delivery_id: String,
    pub option_id: String,
    pub voter_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub accepted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertResult {
    pub inserted: bool,
}

/// Versioned tally derived from every persisted vote.
///
/// Snapshots are immutable; the aggregation engine replaces the current one
/// wholesale on every tick. `total` always equals the sum of `counts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub version: u64,
    pub counts: BTreeMap<OptionId, u64>,
    pub total: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl AggregateSnapshot {
    /// The all-zero tally served before the first aggregation completes.
    pub fn initial(options: &[OptionId]) -> Self {
        Self::from_counts(0, options.iter().map(|opt| (opt.clone(), 0)).collect())
    }

    pub fn from_counts(version: u64, counts: BTreeMap<OptionId, u64>) -> Self {
        let total = counts.values().sum();
        Self {
            version,
            counts,
            total,
            computed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn count(&self, option: &OptionId) -> u64 {
        self.counts.get(option).copied().unwrap_or(0)
    }

    pub fn same_counts(&self, other: &AggregateSnapshot) -> bool {
        self.counts == other.counts
    }

    /// Whole-number share per option. With no votes every option gets an
    /// equal split instead of a division by zero.
    pub fn percentages(&self) -> BTreeMap<OptionId, u64> {
        if self.total == 0 {
            let share = match self.counts.len() {
                0 => 0,
                n => (100.0 / n as f64).round() as u64,
            };
            return self.counts.keys().map(|opt| (opt.clone(), share)).collect();
        }

        let denominator = self.total.max(1) as f64;
        self.counts
            .iter()
            .map(|(opt, &count)| (opt.clone(), (count as f64 / denominator * 100.0).round() as u64))
            .collect()
    }

    pub fn view(&self, channel: &Channel) -> SnapshotView {
        let percentages = self.percentages();
        let (counts, percentages) = match channel {
            Channel::All => (self.counts.clone(), percentages),
            Channel::Option(option) => (
                BTreeMap::from([(option.clone(), self.count(option))]),
                percentages.into_iter().filter(|(opt, _)| opt == option).collect(),
            ),
        };

        SnapshotView {
            version: self.version,
            counts,
            total: self.total,
            percentages,
            computed_at: self.computed_at,
        }
    }
}

/// Subscription filter requested by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    All,
    Option(OptionId),
}

/// Wire shape of a snapshot as seen by one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    pub version: u64,
    pub counts: BTreeMap<OptionId, u64>,
    pub total: u64,
    pub percentages: BTreeMap<OptionId, u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub queue_lag: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_aggregation_at: Option<OffsetDateTime>,
    pub subscriber_count: usize,
    pub processor: ProcessorState,
    pub stale_ticks: u64,
    pub version: u64,
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub option_id: String,
    pub voter_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteAccepted {
    pub delivery_id: String,
}
