//! PowerShell version lookup for a runspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::engine::{Command, Engine, Invocation, SilentHost};

const VERSION_TARGET: &str = "psedit_runspace::version";

/// Script projecting `$PSVersionTable` and the process architecture.
pub const VERSION_QUERY: &str = "[pscustomobject]@{ \
PSVersion = $PSVersionTable.PSVersion.ToString(); \
PSEdition = $PSVersionTable.PSEdition; \
Architecture = $env:PROCESSOR_ARCHITECTURE }";

/// Numeric engine version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PowerShellVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch or build component.
    pub patch: u32,
}

impl PowerShellVersion {
    /// Builds a version from its components.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for PowerShellVersion {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for PowerShellVersion {
    type Err = String;

    /// Parses `7.4.1`, `5.1.19041.1` or `7.5.0-preview.2`; a revision or
    /// prerelease label is ignored.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let core = text.trim().split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.');
        let mut component = |name: &str, required: bool| -> Result<u32, String> {
            match parts.next() {
                Some(part) => part
                    .parse::<u32>()
                    .map_err(|error| format!("invalid {name} component '{part}': {error}")),
                None if required => Err(format!("missing {name} component in '{text}'")),
                None => Ok(0),
            }
        };
        let major = component("major", true)?;
        let minor = component("minor", true)?;
        let patch = component("patch", false)?;
        Ok(Self::new(major, minor, patch))
    }
}

/// Engine edition reported by `$PSVersionTable.PSEdition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerShellEdition {
    /// Windows PowerShell on .NET Framework.
    Desktop,
    /// PowerShell on .NET Core.
    Core,
}

/// Architecture of the hosting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessArchitecture {
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X64,
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
    /// Not reported or not recognised.
    Unknown,
}

impl ProcessArchitecture {
    fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "x86" => Self::X86,
            "amd64" | "x64" => Self::X64,
            "arm" => Self::Arm,
            "arm64" => Self::Arm64,
            _ => Self::Unknown,
        }
    }
}

/// Version information of the engine behind a runspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerShellVersionDetails {
    /// Engine version.
    pub version: PowerShellVersion,
    /// Engine edition.
    pub edition: PowerShellEdition,
    /// Process architecture.
    pub architecture: ProcessArchitecture,
}

impl Default for PowerShellVersionDetails {
    fn default() -> Self {
        Self {
            version: PowerShellVersion::new(5, 0, 0),
            edition: PowerShellEdition::Desktop,
            architecture: ProcessArchitecture::Unknown,
        }
    }
}

#[derive(Deserialize)]
struct VersionRecord {
    #[serde(rename = "PSVersion")]
    version: String,
    #[serde(rename = "PSEdition", default)]
    edition: Option<String>,
    #[serde(rename = "Architecture", default)]
    architecture: Option<String>,
}

impl PowerShellVersionDetails {
    /// Queries the engine's runspace for its version.
    ///
    /// Any failure is logged and yields [`PowerShellVersionDetails::default`].
    pub fn get_version_details(engine: &mut dyn Engine, cancellation: &CancellationToken) -> Self {
        let invocation = Invocation {
            cancellation,
            host: &SilentHost,
            write_output_to_host: false,
            add_to_history: false,
        };
        let outcome = engine
            .invoke(&Command::script(VERSION_QUERY), &invocation)
            .map_err(|error| error.to_string())
            .and_then(|values| Self::from_values(&values));
        match outcome {
            Ok(details) => {
                tracing::debug!(
                    target: VERSION_TARGET,
                    version = %details.version,
                    edition = ?details.edition,
                    architecture = ?details.architecture,
                    "resolved PowerShell version"
                );
                details
            }
            Err(reason) => {
                tracing::warn!(
                    target: VERSION_TARGET,
                    reason = %reason,
                    "could not determine PowerShell version; assuming 5.0 Desktop"
                );
                Self::default()
            }
        }
    }

    fn from_values(values: &[Value]) -> Result<Self, String> {
        let first = values
            .first()
            .ok_or_else(|| String::from("version query produced no output"))?;
        let record: VersionRecord =
            serde_json::from_value(first.clone()).map_err(|error| error.to_string())?;
        let version = record.version.parse::<PowerShellVersion>()?;
        let edition = match record.edition.as_deref() {
            Some(edition) if edition.eq_ignore_ascii_case("core") => PowerShellEdition::Core,
            _ => PowerShellEdition::Desktop,
        };
        let architecture = record
            .architecture
            .as_deref()
            .map_or(ProcessArchitecture::Unknown, ProcessArchitecture::parse);
        Ok(Self {
            version,
            edition,
            architecture,
        })
    }

    /// Whether the engine exposes the native debugger breakpoint API.
    #[must_use]
    pub fn supports_native_breakpoints(&self) -> bool {
        self.version.major >= 7
    }
}
