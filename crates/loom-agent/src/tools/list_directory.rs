use loom_llm::ToolDefinition;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use super::{
    LIST_DIRECTORY_TOOL, RegisteredTool, ToolError, optional_string_argument, resolve_within,
};

pub(super) fn list_directory_tool(root: PathBuf) -> RegisteredTool {
    let root = Arc::new(root);
    RegisteredTool::from_fn(
        ToolDefinition {
            name: LIST_DIRECTORY_TOOL.to_string(),
            description: "List the entries of a workspace directory. Directories end with '/'."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "additionalProperties": false
            }),
        },
        move |args| {
            let root = root.clone();
            async move {
                let path = optional_string_argument(&args, "path")?.unwrap_or(".".to_string());
                let directory = resolve_within(&root, &path)?;
                let mut reader = tokio::fs::read_dir(&directory).await.map_err(|error| {
                    ToolError::Execution(format!("cannot list '{path}': {error}"))
                })?;

                let mut entries = Vec::new();
                while let Some(entry) = reader.next_entry().await? {
                    let mut name = entry.file_name().to_string_lossy().into_owned();
                    if entry.file_type().await?.is_dir() {
                        name.push('/');
                    }
                    entries.push(name);
                }
                entries.sort();
                if entries.is_empty() {
                    Ok(format!("'{path}' is empty"))
                } else {
                    Ok(entries.join("\n"))
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::list_directory_tool;
    use serde_json::json;

    #[tokio::test(flavor = "current_thread")]
    async fn lists_sorted_entries_marking_directories() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        std::fs::write(dir.path().join("b.txt"), "b").expect("fixture");
        std::fs::create_dir(dir.path().join("a_dir")).expect("fixture");
        let tool = list_directory_tool(dir.path().to_path_buf());

        let output = (tool.executor)(json!({}))
            .await
            .expect("listing should succeed");
        assert_eq!(output, "a_dir/\nb.txt");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_directory_is_a_tool_error() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let tool = list_directory_tool(dir.path().to_path_buf());

        let error = (tool.executor)(json!({"path": "nope"}))
            .await
            .expect_err("missing directory should fail");
        assert!(error.to_string().starts_with("cannot list 'nope'"));
    }
}
