use crate::schema::{DeclarationKey, DeclarationType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("File {file}: not a properly formatted declaration document: {reason}")]
    MalformedDocument { file: String, reason: String },

    #[error("File {file}: no recapitulative declaration found for the filing entity")]
    NotADeclaration { file: String },

    #[error("Compared declaration {compared} does not refer to a period earlier than {current}")]
    NonChronologicalComparison {
        compared: DeclarationKey,
        current: DeclarationKey,
    },

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Invalid period {period} for declaration type {declaration_type}")]
    InvalidPeriod {
        declaration_type: DeclarationType,
        period: u32,
    },
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
