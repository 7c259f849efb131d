use crate::schema::{Category, CounterpartyKey, DeclarationKey, ParsedBundle};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Net declared amounts per historical period, per category, per
/// counterparty, accumulated over every input document.
///
/// The ledger is a plain additive structure: merging two ledgers adds their
/// amounts entry-wise, so folding any permutation of the same bundles
/// produces the same ledger. Keys declared with no lines are kept with an
/// empty category map, so the ledger remembers that the period was filed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummarizedLedger {
    periods: BTreeMap<DeclarationKey, BTreeMap<Category, BTreeMap<CounterpartyKey, Decimal>>>,
}

impl SummarizedLedger {
    /// Adds one line's amount into the net for its key, category and
    /// counterparty. Corrective amounts are already signed deltas, so
    /// addition is the whole merge rule.
    pub fn add_line(
        &mut self,
        key: DeclarationKey,
        category: Category,
        counterparty: CounterpartyKey,
        amount: Decimal,
    ) {
        *self
            .periods
            .entry(key)
            .or_default()
            .entry(category)
            .or_default()
            .entry(counterparty)
            .or_insert(Decimal::ZERO) += amount;
    }

    /// Materializes a declared key with no lines ("filed but empty").
    pub fn ensure_key(&mut self, key: DeclarationKey) {
        self.periods.entry(key).or_default();
    }

    /// Entry-wise additive merge; associative and commutative.
    pub fn merge(&mut self, other: SummarizedLedger) {
        for (key, categories) in other.periods {
            let period = self.periods.entry(key).or_default();
            for (category, amounts) in categories {
                let slot = period.entry(category).or_default();
                for (counterparty, amount) in amounts {
                    *slot.entry(counterparty).or_insert(Decimal::ZERO) += amount;
                }
            }
        }
    }

    /// Historical keys in chronological order, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &DeclarationKey> {
        self.periods.keys()
    }

    pub fn contains_key(&self, key: &DeclarationKey) -> bool {
        self.periods.contains_key(key)
    }

    pub fn amounts(
        &self,
        key: &DeclarationKey,
        category: Category,
    ) -> Option<&BTreeMap<CounterpartyKey, Decimal>> {
        self.periods.get(key).and_then(|p| p.get(&category))
    }

    /// Net amount for one counterparty; zero when never declared.
    pub fn amount(
        &self,
        key: &DeclarationKey,
        category: Category,
        counterparty: &CounterpartyKey,
    ) -> Decimal {
        self.amounts(key, category)
            .and_then(|a| a.get(counterparty))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// The ledger contribution of a single bundle. Lines whose key is not
    /// among the declared keys of any input document are left out: a
    /// correction targeting a declaration that was not supplied for
    /// comparison must not drag that period into the run.
    fn from_bundle(bundle: &ParsedBundle, declared: &BTreeSet<DeclarationKey>) -> Self {
        let mut ledger = SummarizedLedger::default();
        for (key, record) in bundle.lines() {
            if declared.contains(key) {
                ledger.add_line(
                    *key,
                    record.category,
                    record.counterparty.clone(),
                    record.amount,
                );
            }
        }
        ledger
    }
}

/// Merges parsed declaration documents into one [`SummarizedLedger`] and
/// returns it together with the ordered, de-duplicated list of every period
/// the documents declare — the record of which historical declarations were
/// found.
pub fn summarize(bundles: &[ParsedBundle]) -> (SummarizedLedger, Vec<DeclarationKey>) {
    let mut declared = Vec::new();
    let mut seen = BTreeSet::new();
    for bundle in bundles {
        for key in &bundle.declared_keys {
            if seen.insert(*key) {
                declared.push(*key);
            }
        }
    }

    let mut ledger = SummarizedLedger::default();
    for key in &declared {
        ledger.ensure_key(*key);
    }
    for bundle in bundles {
        ledger.merge(SummarizedLedger::from_bundle(bundle, &seen));
    }

    (ledger, declared)
}
