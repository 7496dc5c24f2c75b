//! Result ingestion: turns finished work into durable records.

pub mod findings;
pub mod issues;

pub use findings::{attribute, FindingsSummary};
pub use issues::{IngestionPipeline, Issue, IssueStatus, DEFAULT_MAX_RETRIES};
