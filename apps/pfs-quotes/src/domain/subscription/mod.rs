//! Subscription Registry
//!
//! The set of tickers the client wants to stream. The registry is the
//! single source of truth for subscriptions: every time a session opens,
//! the full set is sent to the server, so no subscription is lost across
//! reconnects.
//!
//! # Design
//!
//! - Insertion order is preserved so update requests are deterministic.
//! - Tickers are trimmed; empty tickers are rejected.
//! - Duplicates are ignored.
//! - Mutations report what actually changed.

use std::collections::HashSet;

use parking_lot::RwLock;
use thiserror::Error;

// =============================================================================
// Types
// =============================================================================

/// An instrument identifier (`"gold"`, `"JPYRUB"`, ...).
pub type Ticker = String;

/// Ticker validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TickerError {
    /// Ticker was empty or whitespace only.
    #[error("ticker cannot be empty")]
    Empty,
}

/// Normalize a raw ticker: trim surrounding whitespace, reject empty input.
///
/// # Errors
///
/// Returns [`TickerError::Empty`] for empty or whitespace-only input.
pub fn normalize_ticker(raw: &str) -> Result<Ticker, TickerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TickerError::Empty);
    }
    Ok(trimmed.to_string())
}

/// Normalize a batch of tickers, dropping duplicates while keeping first-seen order.
///
/// # Errors
///
/// Fails on the first invalid ticker; nothing is returned in that case.
pub fn normalize_tickers<I, S>(raw: I) -> Result<Vec<Ticker>, TickerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for ticker in raw {
        let ticker = normalize_ticker(ticker.as_ref())?;
        if seen.insert(ticker.clone()) {
            out.push(ticker);
        }
    }
    Ok(out)
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Outcome of a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Tickers newly added.
    pub added: Vec<Ticker>,
    /// Tickers removed.
    pub removed: Vec<Ticker>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe, insertion-ordered ticker set.
///
/// # Example
///
/// ```rust
/// use pfs_quotes::domain::subscription::SubscriptionRegistry;
///
/// let registry = SubscriptionRegistry::new();
/// registry.subscribe(["gold", "silver"]).unwrap();
/// registry.subscribe(["gold", "JPYRUB"]).unwrap();
/// assert_eq!(registry.tickers(), vec!["gold", "silver", "JPYRUB"]);
///
/// let changes = registry.set_tickers(["silver"]).unwrap();
/// assert_eq!(changes.removed, vec!["gold", "JPYRUB"]);
/// assert_eq!(registry.tickers(), vec!["silver"]);
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    tickers: RwLock<Vec<Ticker>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole subscription set.
    ///
    /// # Errors
    ///
    /// Returns an error if any ticker is invalid; the registry is left untouched.
    pub fn set_tickers<I, S>(&self, tickers: I) -> Result<SubscriptionChanges, TickerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = normalize_tickers(tickers)?;
        let mut current = self.tickers.write();

        let changes = SubscriptionChanges {
            added: next
                .iter()
                .filter(|t| !current.contains(t))
                .cloned()
                .collect(),
            removed: current
                .iter()
                .filter(|t| !next.contains(t))
                .cloned()
                .collect(),
        };
        *current = next;
        drop(current);

        Ok(changes)
    }

    /// Add tickers, ignoring ones already present.
    ///
    /// # Errors
    ///
    /// Returns an error if any ticker is invalid; nothing is added in that case.
    pub fn subscribe<I, S>(&self, tickers: I) -> Result<SubscriptionChanges, TickerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let incoming = normalize_tickers(tickers)?;
        let mut current = self.tickers.write();

        let mut added = Vec::new();
        for ticker in incoming {
            if !current.contains(&ticker) {
                current.push(ticker.clone());
                added.push(ticker);
            }
        }
        drop(current);

        Ok(SubscriptionChanges {
            added,
            removed: Vec::new(),
        })
    }

    /// Remove tickers; unknown tickers are ignored.
    pub fn unsubscribe<I, S>(&self, tickers: I) -> SubscriptionChanges
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: HashSet<String> = tickers
            .into_iter()
            .map(|t| t.as_ref().trim().to_string())
            .collect();
        let mut current = self.tickers.write();

        let mut removed = Vec::new();
        current.retain(|ticker| {
            if targets.contains(ticker) {
                removed.push(ticker.clone());
                false
            } else {
                true
            }
        });
        drop(current);

        SubscriptionChanges {
            added: Vec::new(),
            removed,
        }
    }

    /// Snapshot of the current set, in insertion order.
    #[must_use]
    pub fn tickers(&self) -> Vec<Ticker> {
        self.tickers.read().clone()
    }

    /// Whether `ticker` is subscribed.
    #[must_use]
    pub fn contains(&self, ticker: &str) -> bool {
        self.tickers.read().iter().any(|t| t == ticker)
    }

    /// Number of subscribed tickers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tickers.read().len()
    }

    /// Whether nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickers.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn subscribe_preserves_order_and_dedupes() {
        let registry = SubscriptionRegistry::new();

        let changes = registry.subscribe(["JPYRUB", "gold", "JPYRUB"]).unwrap();
        assert_eq!(changes.added, vec!["JPYRUB", "gold"]);

        let changes = registry.subscribe(["gold", "silver"]).unwrap();
        assert_eq!(changes.added, vec!["silver"]);
        assert_eq!(registry.tickers(), vec!["JPYRUB", "gold", "silver"]);
    }

    #[test]
    fn tickers_are_trimmed() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(["  gold ", "gold"]).unwrap();
        assert_eq!(registry.tickers(), vec!["gold"]);
        assert!(registry.contains("gold"));
    }

    #[test]
    fn empty_ticker_rejects_whole_batch() {
        let registry = SubscriptionRegistry::new();

        let err = registry.subscribe(["gold", "  "]).unwrap_err();

        assert_eq!(err, TickerError::Empty);
        assert!(registry.is_empty());
    }

    #[test]
    fn set_tickers_reports_diff() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(["gold", "silver"]).unwrap();

        let changes = registry.set_tickers(["silver", "goldgrrub"]).unwrap();

        assert_eq!(changes.added, vec!["goldgrrub"]);
        assert_eq!(changes.removed, vec!["gold"]);
        assert_eq!(registry.tickers(), vec!["silver", "goldgrrub"]);
    }

    #[test]
    fn set_same_tickers_is_no_change() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(["gold"]).unwrap();

        let changes = registry.set_tickers(["gold"]).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn unsubscribe_ignores_unknown() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(["gold", "silver"]).unwrap();

        let changes = registry.unsubscribe(["silver", "platinum"]);

        assert_eq!(changes.removed, vec!["silver"]);
        assert_eq!(registry.tickers(), vec!["gold"]);
        assert_eq!(registry.len(), 1);
    }

    proptest! {
        #[test]
        fn registry_never_holds_duplicates(batches in prop::collection::vec(
            prop::collection::vec("[a-zA-Z]{1,6}", 0..8), 0..6,
        )) {
            let registry = SubscriptionRegistry::new();
            for batch in &batches {
                registry.subscribe(batch).unwrap();
            }

            let tickers = registry.tickers();
            let unique: HashSet<_> = tickers.iter().collect();
            prop_assert_eq!(unique.len(), tickers.len());

            for ticker in batches.iter().flatten() {
                prop_assert!(registry.contains(ticker));
            }
        }
    }
}
