pub mod budget;
pub mod execution;
pub mod invoice;
pub mod link;
pub mod suggestion;

pub use budget::{BudgetItem, Contract};
pub use execution::{
    Alert, AlertType, BudgetRealization, ContractExecution, LinkedLineItem,
    RealizationStatus, Severity,
};
pub use invoice::{
    Classification, ClassificationSource, IntegrationStatus, Invoice, InvoiceLineItem,
    StatusChange, ValidationStatus,
};
pub use link::{
    BatchError, BatchErrorKind, BatchLinkResult, BatchWarning, Link, LinkChange,
    LinkRequest, LinkedItem, NewLink,
};
pub use suggestion::{ConfidenceTier, MatchScore, SimilarityFactors, Suggestion};
