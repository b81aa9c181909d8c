//! Continuity markers carried by every chunk.
//!
//! A continuity marker tells downstream stages how a chunk relates to the one
//! before it: same segment, a new unrelated segment, or the end of the run.
//! The supervisor only ever looks at this tag to decide when a run is over.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stream-boundary tag, ordered by precedence.
///
/// When chunks are combined, the highest-precedence tag wins (see [`Continuity::combine`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Continuity {
    /// Continues the current segment.
    #[default]
    #[serde(rename = "withprevious")]
    WithPrevious,
    /// First chunk of a new source file.
    #[serde(rename = "newfile")]
    NewFile,
    /// First chunk after a break in the signal.
    #[serde(rename = "discontinuous")]
    Discontinuous,
    /// Calibration pass completed.
    #[serde(rename = "calibrationChunk")]
    CalibrationChunk,
    /// Final chunk of the run.
    #[serde(rename = "last")]
    Last,
}

impl Continuity {
    pub const ALL: [Continuity; 5] = [
        Continuity::WithPrevious,
        Continuity::NewFile,
        Continuity::Discontinuous,
        Continuity::CalibrationChunk,
        Continuity::Last,
    ];

    /// Name used in configuration files, logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Continuity::WithPrevious => "withprevious",
            Continuity::NewFile => "newfile",
            Continuity::Discontinuous => "discontinuous",
            Continuity::CalibrationChunk => "calibrationChunk",
            Continuity::Last => "last",
        }
    }

    /// Whether a stateful stage must drop its history before handling this chunk.
    pub fn resets_history(self) -> bool {
        matches!(self, Continuity::NewFile | Continuity::Discontinuous)
    }

    /// Whether this tag can end a run (in some run mode).
    pub fn is_terminal(self) -> bool {
        matches!(self, Continuity::CalibrationChunk | Continuity::Last)
    }

    /// Tag of a chunk assembled from parts carrying `self` and `other`.
    pub fn combine(self, other: Continuity) -> Continuity {
        self.max(other)
    }
}

impl fmt::Display for Continuity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Continuity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Continuity::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown continuity marker '{}'", s))
    }
}

/// The tags that end a particular run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSet {
    calibration_chunk: bool,
    last: bool,
}

impl TerminalSet {
    /// Terminal set of ordinary runs: `last` only.
    pub const LAST: TerminalSet = TerminalSet {
        calibration_chunk: false,
        last: true,
    };

    /// Terminal set of calibration runs: `calibrationChunk` only.
    pub const CALIBRATION: TerminalSet = TerminalSet {
        calibration_chunk: true,
        last: false,
    };

    pub fn contains(&self, continuity: Continuity) -> bool {
        match continuity {
            Continuity::CalibrationChunk => self.calibration_chunk,
            Continuity::Last => self.last,
            _ => false,
        }
    }
}

/// How a run is fed, and therefore how it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Generated noise through the calibrator; ends on `calibrationChunk`.
    Calibration,
    /// A finite list of input files; ends on `last`.
    Files,
    /// A live source; ends on `last` or on operator abort.
    Live,
}

impl RunMode {
    pub fn terminal_set(self) -> TerminalSet {
        match self {
            RunMode::Calibration => TerminalSet::CALIBRATION,
            RunMode::Files | RunMode::Live => TerminalSet::LAST,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Calibration => "calibration",
            RunMode::Files => "files",
            RunMode::Live => "live",
        };
        f.write_str(name)
    }
}
