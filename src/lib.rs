#![forbid(unsafe_code)]

//! # assessment-orchestrator
//!
//! Turns a pile of compliance evidence into NIST 800-53 control mappings,
//! OSCAL artifacts, validation results and a remediation plan.
//!
//! An assessment resolves a scope to a concrete control set, then runs five
//! reasoning passes against an external chat-completions service. Controls
//! are grouped into batches so one call covers many of them; the controls
//! that matter most (gaps with elevated risk) get individual, deeper calls
//! instead. Every batch that fails permanently degrades to explicit
//! "needs review" fallback records, so a session always finishes with one
//! record per control.
//!
//! Sessions run in the background. Clients poll or subscribe to status
//! snapshots and read partial results as each pass commits.

pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod estimate;
pub mod evidence;
pub mod gateway;
pub mod orchestrator;
pub mod passes;
pub mod prioritize;
pub mod records;
pub mod scheduler;
pub mod scope;
pub mod server;
pub mod session;

pub use catalog::{Baseline, Catalog, ControlFamily, ControlId};
pub use config::{AssessConfig, ConfigError};
pub use estimate::ProcessingEstimate;
pub use gateway::{ChatGateway, ProviderGateway, UsageSink};
pub use orchestrator::{Orchestrator, Submission, SubmitError};
pub use records::AssessmentResults;
pub use scope::{AssessmentMode, AssessmentScope, ResolvedScope, ScopeError};
pub use session::{SessionError, Stage, StatusSnapshot};
