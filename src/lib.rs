//! ferc-xbrl-extract - taxonomy-driven extraction of tabular data from
//! FERC XBRL filings.
//!
//! The taxonomy defines "fact tables" (link roles grouping concepts); each
//! filing is parsed into facts and contexts, matched against those tables
//! via dimensional (axis) filtering, reconciled, and merged across filings.

pub mod datapackage;
pub mod extract;
pub mod helpers;
pub mod instance;
pub mod sink;
pub mod table;
pub mod taxonomy;

// Re-export main types
pub use datapackage::{Datapackage, FactTable, Resource, Schema};
pub use extract::{extract, ExtractOutput, ExtractionOptions, Form, TableCache};
pub use instance::{get_instances, Instance, InstanceBuilder};
pub use table::{Table, Value};
pub use taxonomy::{Concept, LinkRole, Taxonomy};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("empty or unparsable instance: {0}")]
    EmptyInstance(String),

    #[error("link role definition {0:?} does not match `<code> - Schedule - <name>`")]
    TableName(String),

    #[error("no schema type mapping for XBRL base type {0:?}")]
    TypeMapping(String),

    #[error("fact {context}:{concept} has conflicting values {values:?}")]
    Reconciliation {
        context: String,
        concept: String,
        values: Vec<String>,
    },

    #[error("unsupported FERC form number: {0}")]
    UnknownForm(u32),

    #[error("invalid datapackage descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("worker pool error: {0}")]
    Pool(String),

    #[error("Not found: {0}")]
    NotFound(String),
}
