//! Error kinds callers need to tell apart.
//!
//! Most functions return `anyhow::Result`; these variants are attached where
//! a caller must distinguish a no-op duplicate or a skipped administrative
//! operation from a real failure, without string matching.

use thiserror::Error;

use crate::models::ProductId;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// No summarizer module reported support for the product. Should not
    /// occur while a default module is registered.
    #[error("no summarizer module supports product {0}")]
    UnsupportedProduct(ProductId),

    /// The exact product version is already stored. Non-fatal; callers log
    /// and skip.
    #[error("product already in storage: {0}")]
    AlreadyInStorage(ProductId),

    /// An administrative associate/disassociate referenced an event that
    /// does not exist. The link operation is skipped.
    #[error("administrative {operation} references unknown event {event_source}{code}")]
    AssociationConflict {
        operation: &'static str,
        event_source: String,
        code: String,
    },
}
