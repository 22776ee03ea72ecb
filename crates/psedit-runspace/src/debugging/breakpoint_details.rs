//! Resolved breakpoints reported back to the editor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineBreakpoint, EngineBreakpointKind};

/// Fields shared by every breakpoint kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BreakpointDetailsBase {
    /// Engine id, absent when the engine rejected the breakpoint.
    pub id: Option<u32>,
    /// Whether the engine accepted the breakpoint.
    pub verified: bool,
    /// Reason the breakpoint was not verified.
    pub message: Option<String>,
    /// Condition expression.
    pub condition: Option<String>,
    /// Hit count that triggers the breakpoint.
    pub hit_condition: Option<String>,
    /// Message logged instead of stopping.
    pub log_message: Option<String>,
}

/// A breakpoint after the engine processed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakpointDetails {
    /// Stops at a script line.
    Line {
        /// Shared fields.
        #[serde(flatten)]
        base: BreakpointDetailsBase,
        /// Script containing the line.
        source: PathBuf,
        /// One-based line.
        line: u32,
        /// One-based column, when targeted.
        column: Option<u32>,
    },
    /// Stops when a command is invoked.
    Command {
        /// Shared fields.
        #[serde(flatten)]
        base: BreakpointDetailsBase,
        /// Command name or wildcard.
        name: String,
    },
}

impl BreakpointDetails {
    /// Shared fields.
    #[must_use]
    pub fn base(&self) -> &BreakpointDetailsBase {
        match self {
            Self::Line { base, .. } | Self::Command { base, .. } => base,
        }
    }

    /// Whether the engine accepted the breakpoint.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.base().verified
    }

    /// Projects an engine breakpoint; variable breakpoints have no projection.
    pub(crate) fn from_engine(breakpoint: &EngineBreakpoint, base: BreakpointDetailsBase) -> Option<Self> {
        let base = BreakpointDetailsBase {
            id: Some(breakpoint.id),
            verified: true,
            message: None,
            ..base
        };
        match &breakpoint.kind {
            EngineBreakpointKind::Line {
                script,
                line,
                column,
            } => Some(Self::Line {
                base,
                source: script.clone(),
                line: *line,
                column: *column,
            }),
            EngineBreakpointKind::Command { name, .. } => Some(Self::Command {
                base,
                name: name.clone(),
            }),
            EngineBreakpointKind::Variable { .. } => None,
        }
    }
}
