use crate::error::Result;
use crate::schema::{Category, CounterpartyKey, DeclarationKey};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// One authoritative amount row returned by the ledger collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerRow {
    pub category: Category,
    pub country: String,
    pub vat: String,
    pub amount: Decimal,
}

/// The external general-ledger collaborator supplying the amounts that
/// *would* be reported today for a date range.
///
/// The engine treats answers as ground truth and performs no validation
/// beyond type and precision. Implementations signal failure with
/// [`ReconcileError::LedgerUnavailable`](crate::ReconcileError::LedgerUnavailable);
/// the engine propagates it without retrying, so an answer always reflects
/// the state of the books at call time.
pub trait LedgerSource {
    fn query(
        &self,
        filing_entity: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<Vec<LedgerRow>>;
}

/// Authoritative current amounts for one historical period, freshly
/// recomputed at reconciliation time. Ephemeral: built for one diff, then
/// discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeriodSnapshot {
    amounts: BTreeMap<Category, BTreeMap<CounterpartyKey, Decimal>>,
}

impl PeriodSnapshot {
    pub fn add(&mut self, category: Category, counterparty: CounterpartyKey, amount: Decimal) {
        *self
            .amounts
            .entry(category)
            .or_default()
            .entry(counterparty)
            .or_insert(Decimal::ZERO) += amount;
    }

    pub fn amounts(&self, category: Category) -> Option<&BTreeMap<CounterpartyKey, Decimal>> {
        self.amounts.get(&category)
    }

    pub fn amount(&self, category: Category, counterparty: &CounterpartyKey) -> Decimal {
        self.amounts(category)
            .and_then(|a| a.get(counterparty))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.values().all(|a| a.is_empty())
    }
}

/// Recomputes the authoritative amounts for the period a key denotes, by
/// querying the collaborator over the key's first-to-last calendar day.
/// Duplicate rows for one counterparty are summed; counterparty keys are
/// normalized and amounts held at 2-decimal precision.
pub fn recompute_period(
    source: &impl LedgerSource,
    filing_entity: &str,
    key: DeclarationKey,
) -> Result<PeriodSnapshot> {
    let (date_from, date_to) = key.date_range();
    let rows = source.query(filing_entity, date_from, date_to)?;

    let mut snapshot = PeriodSnapshot::default();
    for row in rows {
        snapshot.add(
            row.category,
            CounterpartyKey::new(&row.country, &row.vat),
            row.amount.round_dp(2),
        );
    }
    Ok(snapshot)
}
