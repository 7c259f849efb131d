use crate::error::{ReconcileError, Result};
use crate::ledger::{recompute_period, LedgerSource};
use crate::schema::{CounterpartyKey, DeclarationKey};
use crate::summary::SummarizedLedger;
use crate::utils::is_zero_at_reporting_precision;
use crate::CorrectionSet;
use log::debug;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};

/// Diffs the summarized historical declarations against freshly recomputed
/// authoritative amounts and produces the correction set.
///
/// Every declared key must be strictly earlier than `current` — correcting
/// the declaring period itself is not allowed, and correcting a later one
/// makes no sense. A single violation aborts the run: a partially-corrected
/// filing would be numerically misleading.
///
/// Keys are processed oldest first, so a correction to a period can be read
/// next to the corrections-of-corrections the input documents already
/// applied to it; deltas for different keys never interact, so the order
/// does not change the result.
pub fn reconcile(
    ledger: &SummarizedLedger,
    declared_keys: &[DeclarationKey],
    current: DeclarationKey,
    filing_entity: &str,
    source: &impl LedgerSource,
) -> Result<CorrectionSet> {
    for key in declared_keys {
        if !key.is_strictly_before(&current) {
            return Err(ReconcileError::NonChronologicalComparison {
                compared: *key,
                current,
            });
        }
    }

    let empty = BTreeMap::new();
    let mut corrections = CorrectionSet::new();

    for key in ledger.keys() {
        let snapshot = recompute_period(source, filing_entity, *key)?;

        // A goods key participates in the goods and triangular categories
        // only; a services key in the services category only
        for &category in key.categories() {
            let summarized = ledger.amounts(key, category).unwrap_or(&empty);
            let authoritative = snapshot.amounts(category).unwrap_or(&empty);

            let mut counterparties: BTreeSet<&CounterpartyKey> = summarized.keys().collect();
            counterparties.extend(authoritative.keys());

            for counterparty in counterparties {
                let declared = summarized
                    .get(counterparty)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                let recomputed = authoritative
                    .get(counterparty)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                let delta = recomputed - declared;
                if !is_zero_at_reporting_precision(delta) {
                    corrections.record(category, *key, counterparty.clone(), delta);
                }
            }
        }

        debug!("Compared {key} against recomputed ledger data");
    }

    Ok(corrections)
}
