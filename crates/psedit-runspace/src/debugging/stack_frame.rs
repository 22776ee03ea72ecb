//! Call stack entries shown while the debugger is stopped.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::EngineStackFrame;

/// Placeholder shown for frames that did not come from a script file.
pub const NO_FILE: &str = "<No File>";

/// One entry of the call stack, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrameDetails {
    /// Function or script block name.
    pub function_name: String,
    /// Script path, or [`NO_FILE`] for interactive input.
    pub script_path: String,
    /// One-based line.
    pub line: u32,
    /// One-based column.
    pub column: u32,
    /// Whether the frame lies outside the workspace.
    pub is_external_code: bool,
    /// Variable container holding the frame's locals.
    pub locals_id: u32,
}

impl StackFrameDetails {
    pub(crate) fn from_engine(
        frame: &EngineStackFrame,
        locals_id: u32,
        workspace_root: Option<&Path>,
    ) -> Self {
        let is_external_code = match (frame.script_path.as_deref(), workspace_root) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(path), Some(root)) => !path.starts_with(root),
        };
        Self {
            function_name: frame.function_name.clone(),
            script_path: frame
                .script_path
                .as_ref()
                .map_or_else(|| String::from(NO_FILE), |path| path.display().to_string()),
            line: frame.line,
            column: frame.column,
            is_external_code,
            locals_id,
        }
    }

    /// Whether the frame has a backing script file.
    #[must_use]
    pub fn has_file(&self) -> bool {
        self.script_path != NO_FILE
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rstest::rstest;

    use super::*;

    fn engine_frame(path: Option<&str>) -> EngineStackFrame {
        EngineStackFrame {
            function_name: String::from("Invoke-Build"),
            script_path: path.map(PathBuf::from),
            line: 12,
            column: 5,
            locals: Vec::new(),
        }
    }

    #[rstest]
    #[case(Some("/work/build.ps1"), Some("/work"), false)]
    #[case(Some("/modules/helper.psm1"), Some("/work"), true)]
    #[case(None, Some("/work"), true)]
    #[case(Some("/modules/helper.psm1"), None, false)]
    fn classifies_external_code(
        #[case] path: Option<&str>,
        #[case] root: Option<&str>,
        #[case] expected: bool,
    ) {
        let root = root.map(PathBuf::from);
        let details = StackFrameDetails::from_engine(&engine_frame(path), 1, root.as_deref());
        assert_eq!(details.is_external_code, expected);
    }

    #[rstest]
    fn uses_placeholder_for_interactive_frames() {
        let details = StackFrameDetails::from_engine(&engine_frame(None), 1, None);
        assert_eq!(details.script_path, NO_FILE);
        assert!(!details.has_file());
    }
}
