//! Reset-aware counter accumulation
//!
//! The monitored site reports a `current/total` counter per row that drops back
//! towards zero whenever the underlying activity restarts. Each account owns an
//! [`AccumulationEngine`] that remembers the last observation per
//! [`NaturalKey`] and folds every drop into a running lifetime total:
//!
//! - a drop larger than [`RESET_THRESHOLD`] is a reset, so the whole pre-reset
//!   value is added
//! - a smaller drop is measurement drift, so only the difference is added
//! - a rise or an unchanged value leaves the total untouched
//!
//! The engine also tallies configured anomaly keywords found in the row's
//! free-text fields.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::record::{AccumulatedRecord, NaturalKey, RawRecord};

/// Drops strictly larger than this are treated as counter resets
pub const RESET_THRESHOLD: i64 = 5;

/// How a new observation related to the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// First time this key was seen
    First,
    /// The counter restarted; `folded` is the pre-reset value added to the total
    Reset { folded: i64 },
    /// Small decrease added as-is
    Drift { delta: i64 },
    /// Counter rose or stayed put
    Steady,
}

/// Apply the reconciliation rule to a single counter.
///
/// `previous` is `(previous count_current, previous accumulated_count)`.
/// Returns the new accumulated count and how it was derived.
pub fn reconcile_count(previous: Option<(i64, i64)>, current: i64) -> (i64, Reconciliation) {
    let Some((prev_current, prev_accumulated)) = previous else {
        return (0, Reconciliation::First);
    };

    if current < prev_current {
        let drop = prev_current - current;
        if drop > RESET_THRESHOLD {
            (
                prev_accumulated.saturating_add(prev_current),
                Reconciliation::Reset { folded: prev_current },
            )
        } else {
            (
                prev_accumulated.saturating_add(drop),
                Reconciliation::Drift { delta: drop },
            )
        }
    } else {
        (prev_accumulated, Reconciliation::Steady)
    }
}

/// Case-sensitive substring counter over a fixed keyword list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordScanner {
    keywords: Vec<String>,
}

impl KeywordScanner {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let keywords = keywords
            .into_iter()
            .map(Into::into)
            .filter(|k: &String| !k.is_empty() && seen.insert(k.clone()))
            .collect();
        Self { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Non-overlapping occurrences per keyword; keywords with zero hits are omitted
    pub fn scan(&self, record: &RawRecord) -> BTreeMap<String, u32> {
        let fields = record.scanned_fields();
        self.keywords
            .iter()
            .filter_map(|keyword| {
                let hits: usize = fields
                    .iter()
                    .map(|field| field.matches(keyword.as_str()).count())
                    .sum();
                (hits > 0).then(|| (keyword.clone(), u32::try_from(hits).unwrap_or(u32::MAX)))
            })
            .collect()
    }
}

/// One account's cross-cycle memory.
///
/// Owned by the orchestrator's registry and mutated only by that account's
/// task, so no locking happens in here.
#[derive(Debug, Clone)]
pub struct AccumulationEngine {
    account: String,
    scanner: KeywordScanner,
    state: HashMap<NaturalKey, AccumulatedRecord>,
}

impl AccumulationEngine {
    pub fn new(account: impl Into<String>, scanner: KeywordScanner) -> Self {
        Self {
            account: account.into(),
            scanner,
            state: HashMap::new(),
        }
    }

    /// Rebuild the baseline from previously persisted records
    pub fn restore<I>(account: impl Into<String>, scanner: KeywordScanner, records: I) -> Self
    where
        I: IntoIterator<Item = AccumulatedRecord>,
    {
        let mut engine = Self::new(account, scanner);
        for record in records {
            if record.account_username() == engine.account {
                engine.state.insert(record.natural_key(), record);
            }
        }
        engine
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Swap the keyword list; applies from the next observation on
    pub fn set_scanner(&mut self, scanner: KeywordScanner) {
        self.scanner = scanner;
    }

    pub fn scanner(&self) -> &KeywordScanner {
        &self.scanner
    }

    pub fn previous(&self, key: &NaturalKey) -> Option<&AccumulatedRecord> {
        self.state.get(key)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Current baseline, sorted by key, for checkpointing
    pub fn snapshot(&self) -> Vec<AccumulatedRecord> {
        let mut records: Vec<_> = self.state.values().cloned().collect();
        records.sort_by(|a, b| a.natural_key().cmp(&b.natural_key()));
        records
    }

    /// Reconcile one row against the baseline and remember the result
    pub fn observe(&mut self, raw: RawRecord, observed_at: DateTime<Utc>) -> AccumulatedRecord {
        let key = raw.natural_key();
        let previous = self
            .state
            .get(&key)
            .map(|prev| (prev.raw.count_current, prev.accumulated_count));
        let (accumulated_count, how) = reconcile_count(previous, raw.count_current);

        if let Reconciliation::Reset { folded } = how {
            debug!(
                account = %self.account,
                sequence = key.sequence_number,
                ip = %key.ip,
                folded,
                "counter reset detected"
            );
        }

        let record = AccumulatedRecord {
            anomaly_keywords: self.scanner.scan(&raw),
            raw,
            accumulated_count,
            observed_at,
        };
        self.state.insert(key, record.clone());
        record
    }

    /// Reconcile a whole extraction in table order
    pub fn observe_all(&mut self, rows: Vec<RawRecord>, observed_at: DateTime<Utc>) -> Vec<AccumulatedRecord> {
        rows.into_iter().map(|raw| self.observe(raw, observed_at)).collect()
    }
}
