pub mod alerts;
pub mod linker;
pub mod matcher;
pub mod realization;
pub mod reconciler;
pub mod report;
pub mod validation;

pub use linker::{ClassifyOutcome, Linker};
pub use matcher::{HeuristicScorer, MatchScorer};
pub use realization::ContractSnapshot;
pub use reconciler::{InvoiceOutcome, InvoiceTransition, ReconciliationService, UnlinkedInvoice};
