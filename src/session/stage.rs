use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stages in their only legal order, followed by the terminal
/// `Error`, which is reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Uploading,
    Initializing,
    Scoping,
    Processing,
    Analyzing,
    Mapping,
    Generating,
    ValidatingNist,
    ValidatingOscal,
    Planning,
    Finalizing,
    Complete,
    Error,
}

impl Stage {
    pub const ORDERED: [Stage; 12] = [
        Stage::Uploading,
        Stage::Initializing,
        Stage::Scoping,
        Stage::Processing,
        Stage::Analyzing,
        Stage::Mapping,
        Stage::Generating,
        Stage::ValidatingNist,
        Stage::ValidatingOscal,
        Stage::Planning,
        Stage::Finalizing,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Uploading => "uploading",
            Stage::Initializing => "initializing",
            Stage::Scoping => "scoping",
            Stage::Processing => "processing",
            Stage::Analyzing => "analyzing",
            Stage::Mapping => "mapping",
            Stage::Generating => "generating",
            Stage::ValidatingNist => "validating_nist",
            Stage::ValidatingOscal => "validating_oscal",
            Stage::Planning => "planning",
            Stage::Finalizing => "finalizing",
            Stage::Complete => "complete",
            Stage::Error => "error",
        }
    }

    /// Progress range `[start, end]` owned by this stage.
    pub fn band(&self) -> (u8, u8) {
        match self {
            Stage::Uploading => (0, 1),
            Stage::Initializing => (1, 5),
            Stage::Scoping => (5, 10),
            Stage::Processing => (10, 20),
            Stage::Analyzing => (20, 35),
            Stage::Mapping => (35, 50),
            Stage::Generating => (50, 65),
            Stage::ValidatingNist => (65, 75),
            Stage::ValidatingOscal => (75, 85),
            Stage::Planning => (85, 93),
            Stage::Finalizing => (93, 100),
            Stage::Complete => (100, 100),
            Stage::Error => (0, 100),
        }
    }

    /// Progress after `done` of `total` units within this stage.
    pub fn progress_at(&self, done: usize, total: usize) -> u8 {
        let (start, end) = self.band();
        if total == 0 || done >= total {
            return end;
        }
        let span = usize::from(end - start);
        start + (span * done / total) as u8
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }

    pub fn default_step(&self) -> &'static str {
        match self {
            Stage::Uploading => "Receiving evidence",
            Stage::Initializing => "Initializing assessment",
            Stage::Scoping => "Resolving assessment scope",
            Stage::Processing => "Processing evidence files",
            Stage::Analyzing => "Extracting evidence inventory",
            Stage::Mapping => "Mapping controls and analysing gaps",
            Stage::Generating => "Generating OSCAL components and POA&M entries",
            Stage::ValidatingNist => "Validating controls against NIST 800-53",
            Stage::ValidatingOscal => "Validating OSCAL documents",
            Stage::Planning => "Planning remediation",
            Stage::Finalizing => "Finalizing results",
            Stage::Complete => "Assessment complete",
            Stage::Error => "Assessment failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
