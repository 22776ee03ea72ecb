//! Execution policy applied to the session runspace at startup.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// PowerShell execution policies accepted for the process scope.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, EnumString, Display)]
#[strum(ascii_case_insensitive)]
pub enum ExecutionPolicy {
    /// Only scripts signed by a trusted publisher run.
    AllSigned,
    /// Nothing is blocked and no warnings are shown.
    Bypass,
    /// Restores the platform default policy.
    Default,
    /// Downloaded scripts must be signed.
    RemoteSigned,
    /// Script files are not loaded.
    Restricted,
    /// Removes the policy from the process scope.
    Undefined,
    /// Unsigned scripts run after a warning for remote files.
    Unrestricted,
}

impl ExecutionPolicy {
    /// Whether the policy stops unsigned local profile scripts from loading.
    #[must_use]
    pub fn blocks_unsigned_scripts(self) -> bool {
        matches!(self, Self::AllSigned | Self::Restricted)
    }
}

/// Errors encountered while parsing an [`ExecutionPolicy`] from text.
pub type ExecutionPolicyParseError = strum::ParseError;
