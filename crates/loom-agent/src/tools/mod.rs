mod bridge;
mod list_directory;
mod read_file;
mod registry;

use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

pub use bridge::ToolBridge;
pub use registry::{RegisteredTool, ToolExecutor, ToolFuture, ToolRegistry};

pub const READ_FILE_TOOL: &str = "read_file";
pub const LIST_DIRECTORY_TOOL: &str = "list_directory";

/// Prefix given to tool failures turned into output strings.
pub const TOOL_ERROR_MARKER: &str = "Error: ";
/// Output prefixes that classify a tool result as failed.
pub const TOOL_FAILURE_MARKERS: [&str; 2] = ["Error:", "ERROR:"];
pub const RESULT_PREVIEW_CHARS: usize = 500;

/// Failure raised by a tool executor. Never escapes the bridge.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    Validation(String),
    #[error("{0}")]
    Execution(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Registry preloaded with the built-in filesystem tools, scoped to `root`.
pub fn build_filesystem_tool_registry(root: impl Into<PathBuf>) -> ToolRegistry {
    let root = root.into();
    let mut registry = ToolRegistry::default();
    registry.register(read_file::read_file_tool(root.clone()));
    registry.register(list_directory::list_directory_tool(root));
    registry
}

pub fn is_failure_output(output: &str) -> bool {
    TOOL_FAILURE_MARKERS
        .iter()
        .any(|marker| output.starts_with(marker))
}

pub fn tool_error_output(error: &ToolError) -> String {
    format!("{TOOL_ERROR_MARKER}{error}")
}

pub fn result_preview(output: &str) -> String {
    output.chars().take(RESULT_PREVIEW_CHARS).collect()
}

fn required_string_argument(arguments: &Value, key: &str) -> Result<String, ToolError> {
    optional_string_argument(arguments, key)?
        .ok_or_else(|| ToolError::Validation(format!("missing required argument '{key}'")))
}

fn optional_string_argument(arguments: &Value, key: &str) -> Result<Option<String>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_str() else {
        return Err(ToolError::Validation(format!(
            "argument '{key}' must be a string"
        )));
    };
    Ok(Some(value.to_string()))
}

fn optional_usize_argument(arguments: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    let Some(value) = arguments.get(key) else {
        return Ok(None);
    };
    let Some(value) = value.as_u64() else {
        return Err(ToolError::Validation(format!(
            "argument '{key}' must be a positive integer"
        )));
    };
    Ok(Some(value as usize))
}

/// Joins a tool-supplied relative path onto `root`, refusing escapes.
fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(ToolError::Validation(format!(
            "path '{relative}' must be relative to the workspace"
        )));
    }
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::Validation(format!(
                    "path '{relative}' escapes the workspace"
                )));
            }
        }
    }
    Ok(resolved)
}

fn format_line_numbered_content(content: &str, start_line: usize) -> String {
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| format!("{} | {}", start_line + idx, line))
        .collect::<Vec<String>>()
        .join("\n")
}
