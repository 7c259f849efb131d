//! # Declaration Reconciler
//!
//! A library for reconciling previously filed recapitulative declarations
//! (periodic statements of intra-community transaction amounts, grouped by
//! counterparty and category) against freshly recomputed ledger data,
//! producing the minimal set of corrections a new filing must carry.
//!
//! ## Core Concepts
//!
//! - **Declaration document**: one historical filed XML payload, possibly
//!   holding several declarations (periods) for the filing entity
//! - **Summarized ledger**: the per-period, per-category, per-counterparty
//!   net of everything the supplied documents declared, corrective lines
//!   included
//! - **Authoritative snapshot**: what the books say *today* for a historical
//!   period, obtained fresh from the ledger collaborator
//! - **Correction set**: the per-category deltas between the two, with
//!   per-category totals, ready to be embedded in the outgoing filing
//!
//! ## Example
//!
//! ```rust,ignore
//! use declaration_reconciler::*;
//!
//! let documents = vec![("april.xml".to_string(), april_xml_bytes)];
//! let current = DeclarationKey::new(DeclarationType::GoodsMonthly, 2020, 5)?;
//!
//! let outcome = reconcile_declaration_documents(
//!     &documents,
//!     "1111111111111",
//!     current,
//!     &my_ledger_source,
//! )?;
//!
//! for (category, periods) in &outcome.correction_set.corrections {
//!     for (key, deltas) in periods {
//!         for (counterparty, delta) in deltas {
//!             println!("{category} {key} {counterparty}: {delta}");
//!         }
//!     }
//! }
//! ```

pub mod compare;
pub mod error;
pub mod ledger;
pub mod parser;
pub mod schema;
pub mod summary;
pub mod utils;

pub use compare::reconcile;
pub use error::{ReconcileError, Result};
pub use ledger::{recompute_period, LedgerRow, LedgerSource, PeriodSnapshot};
pub use parser::parse_document;
pub use schema::*;
pub use summary::{summarize, SummarizedLedger};

use log::{debug, info};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The deltas needed to reconcile historical filings with current
/// authoritative data: `category → declaration key → counterparty → delta`,
/// plus per-category totals.
///
/// Deltas within rounding tolerance of zero are never recorded, and a key
/// whose deltas all vanish is absent entirely; `totals` always carries all
/// three categories. Produced fresh on every reconciliation run and never
/// persisted here — persistence, if any, is the caller's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionSet {
    pub corrections:
        BTreeMap<Category, BTreeMap<DeclarationKey, BTreeMap<CounterpartyKey, Decimal>>>,
    pub totals: BTreeMap<Category, Decimal>,
}

impl CorrectionSet {
    pub fn new() -> Self {
        let mut totals = BTreeMap::new();
        for category in [Category::Goods, Category::Triangular, Category::Services] {
            totals.insert(category, Decimal::ZERO);
        }
        Self {
            corrections: BTreeMap::new(),
            totals,
        }
    }

    pub(crate) fn record(
        &mut self,
        category: Category,
        key: DeclarationKey,
        counterparty: CounterpartyKey,
        delta: Decimal,
    ) {
        self.corrections
            .entry(category)
            .or_default()
            .entry(key)
            .or_default()
            .insert(counterparty, delta);
        *self.totals.entry(category).or_insert(Decimal::ZERO) += delta;
    }

    /// The surviving deltas for one category and key, if any.
    pub fn deltas(
        &self,
        category: Category,
        key: &DeclarationKey,
    ) -> Option<&BTreeMap<CounterpartyKey, Decimal>> {
        self.corrections.get(&category).and_then(|c| c.get(key))
    }

    pub fn delta(
        &self,
        category: Category,
        key: &DeclarationKey,
        counterparty: &CounterpartyKey,
    ) -> Option<Decimal> {
        self.deltas(category, key)
            .and_then(|d| d.get(counterparty))
            .copied()
    }

    /// Sum of all surviving deltas in a category, across every key.
    pub fn total(&self, category: Category) -> Decimal {
        self.totals.get(&category).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.corrections.values().all(|c| c.is_empty())
    }
}

impl Default for CorrectionSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of one reconciliation run: the correction set, plus the
/// ordered list of every historical declaration found in the supplied
/// documents (reported so the caller can show which filings were compared).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub correction_set: CorrectionSet,
    pub compared_declarations: Vec<DeclarationKey>,
}

/// Runs the full pipeline for one filing entity: parse every supplied
/// document, summarize, recompute each referenced period, diff.
pub struct DeclarationReconciler {
    filing_entity: String,
}

impl DeclarationReconciler {
    pub fn new(filing_entity: impl Into<String>) -> Self {
        Self {
            filing_entity: filing_entity.into(),
        }
    }

    /// Reconciles the named historical documents against recomputed ledger
    /// data, for a new filing of period `current`.
    ///
    /// Fails on the first unusable document (with its name in the error, so
    /// the caller can exclude it and retry), on any declared period not
    /// strictly earlier than `current`, and on collaborator failure. No
    /// partial correction set is ever returned.
    pub fn reconcile_documents(
        &self,
        documents: &[(String, Vec<u8>)],
        current: DeclarationKey,
        source: &impl LedgerSource,
    ) -> Result<Reconciliation> {
        info!(
            "Reconciling {} comparison document(s) for filing {}",
            documents.len(),
            current
        );

        let mut bundles = Vec::with_capacity(documents.len());
        for (name, bytes) in documents {
            bundles.push(parser::parse_document(name, bytes, &self.filing_entity)?);
        }

        let (ledger, compared_declarations) = summary::summarize(&bundles);
        debug!(
            "Documents declare {} historical period(s)",
            compared_declarations.len()
        );

        let correction_set = compare::reconcile(
            &ledger,
            &compared_declarations,
            current,
            &self.filing_entity,
            source,
        )?;

        info!(
            "Correction totals: L {} / T {} / S {}",
            correction_set.total(Category::Goods),
            correction_set.total(Category::Triangular),
            correction_set.total(Category::Services)
        );

        Ok(Reconciliation {
            correction_set,
            compared_declarations,
        })
    }
}

pub fn reconcile_declaration_documents(
    documents: &[(String, Vec<u8>)],
    filing_entity: &str,
    current: DeclarationKey,
    source: &impl LedgerSource,
) -> Result<Reconciliation> {
    DeclarationReconciler::new(filing_entity).reconcile_documents(documents, current, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    struct EmptyLedger;

    impl LedgerSource for EmptyLedger {
        fn query(&self, _: &str, _: NaiveDate, _: NaiveDate) -> Result<Vec<LedgerRow>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_no_documents_yields_no_corrections() {
        let current = DeclarationKey::new(DeclarationType::GoodsMonthly, 2020, 5).unwrap();
        let outcome =
            reconcile_declaration_documents(&[], "1111111111111", current, &EmptyLedger).unwrap();

        assert!(outcome.compared_declarations.is_empty());
        assert!(outcome.correction_set.is_empty());
        assert_eq!(outcome.correction_set.total(Category::Goods), Decimal::ZERO);
    }

    #[test]
    fn test_unusable_document_aborts_with_its_name() {
        let current = DeclarationKey::new(DeclarationType::GoodsMonthly, 2020, 5).unwrap();
        let documents = vec![(
            "broken.xml".to_string(),
            b"<eCDFDeclarations><Declarations></wrong>".to_vec(),
        )];

        let err =
            reconcile_declaration_documents(&documents, "1111111111111", current, &EmptyLedger)
                .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::MalformedDocument { file, .. } if file == "broken.xml"
        ));
    }

    #[test]
    fn test_correction_set_serializes_with_string_keys() {
        let mut set = CorrectionSet::new();
        set.record(
            Category::Goods,
            DeclarationKey::new(DeclarationType::GoodsMonthly, 2020, 4).unwrap(),
            CounterpartyKey::new("BE", "0477472701"),
            Decimal::new(100, 2),
        );

        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(
            json["corrections"]["Goods"]["TVA_LICM 2020/4"]["BE 0477472701"],
            serde_json::json!("1.00")
        );
        assert_eq!(json["totals"]["Goods"], serde_json::json!("1.00"));
    }
}
