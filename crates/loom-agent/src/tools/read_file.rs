use loom_llm::ToolDefinition;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use super::{
    READ_FILE_TOOL, RegisteredTool, ToolError, format_line_numbered_content,
    optional_usize_argument, required_string_argument, resolve_within,
};

pub(super) fn read_file_tool(root: PathBuf) -> RegisteredTool {
    let root = Arc::new(root);
    RegisteredTool::from_fn(
        ToolDefinition {
            name: READ_FILE_TOOL.to_string(),
            description: "Read a text file from the workspace. Returns line-numbered content."
                .to_string(),
            parameters: json!({
                "type": "object",
                "required": ["file_path"],
                "properties": {
                    "file_path": { "type": "string" },
                    "offset": { "type": "integer" },
                    "limit": { "type": "integer" }
                },
                "additionalProperties": false
            }),
        },
        move |args| {
            let root = root.clone();
            async move {
                let file_path = required_string_argument(&args, "file_path")?;
                let offset = optional_usize_argument(&args, "offset")?.unwrap_or(1).max(1);
                let limit = optional_usize_argument(&args, "limit")?;

                let path = resolve_within(&root, &file_path)?;
                let content = tokio::fs::read_to_string(&path).await.map_err(|error| {
                    ToolError::Execution(format!("cannot read '{file_path}': {error}"))
                })?;
                let selected: Vec<&str> = content
                    .lines()
                    .skip(offset - 1)
                    .take(limit.unwrap_or(usize::MAX))
                    .collect();
                if selected.is_empty() {
                    return Ok(format!("'{file_path}' has no lines from line {offset}"));
                }
                Ok(format_line_numbered_content(&selected.join("\n"), offset))
            }
        },
    )
}
