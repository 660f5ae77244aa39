//! Workspace-confined file tools registered by the daemon.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use strand_agent::approval::WRITE_FILE_TOOL_NAME;
use strand_agent::chat::WRITE_TODOS_TOOL_NAME;
use strand_agent::registry::ToolRegistry;
use strand_core::error::ToolError;
use strand_core::tool::{
    ParameterSchema, PropertySchema, Tool, ToolArgs, ToolContext, ToolDefinition, ToolResult,
};

const MAX_SEARCH_MATCHES: usize = 200;
const MAX_GLOB_RESULTS: usize = 500;

fn invalid(name: &str, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn failed(name: &str, message: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn str_arg<'a>(tool: &str, args: &'a ToolArgs, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid(tool, format!("'{key}' must be a string")))
}

/// Resolve `requested` inside `root`. Parent-directory hops and absolute paths
/// outside the workspace are refused.
fn resolve(tool: &str, root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(requested);
    if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid(tool, format!("path '{requested}' leaves the workspace")));
    }
    if candidate.is_absolute() {
        return candidate
            .starts_with(root)
            .then(|| candidate.to_path_buf())
            .ok_or_else(|| invalid(tool, format!("path '{requested}' is outside the workspace")));
    }
    Ok(root.join(candidate))
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

pub struct ListDirectoryTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "List the entries of a directory in the workspace.".into(),
            parameters: ParameterSchema::object().property(
                "path",
                PropertySchema::string().describe("Directory relative to the workspace root."),
                true,
            ),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let dir = resolve(self.name(), &self.root, str_arg(self.name(), &args, "path")?)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| failed(self.name(), format!("{}: {e}", dir.display())))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| failed(self.name(), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        let display = format!("Listed {} item(s).", entries.len());
        Ok(ToolResult::structured(json!(entries), display))
    }
}

pub struct ReadFileTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Read a UTF-8 text file from the workspace.".into(),
            parameters: ParameterSchema::object()
                .property(
                    "path",
                    PropertySchema::string().describe("File relative to the workspace root."),
                    true,
                )
                .property(
                    "offset",
                    PropertySchema::new("integer").describe("First line to return (0-based)."),
                    false,
                )
                .property(
                    "limit",
                    PropertySchema::new("integer").describe("Maximum number of lines."),
                    false,
                ),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let path = resolve(self.name(), &self.root, str_arg(self.name(), &args, "path")?)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| failed(self.name(), format!("{}: {e}", path.display())))?;

        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|l| l as usize);
        if offset == 0 && limit.is_none() {
            return Ok(ToolResult::text(content));
        }
        let lines: Vec<&str> = content
            .lines()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(ToolResult::text(lines.join("\n")))
    }
}

pub struct GlobTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Find workspace files matching a glob pattern such as 'src/**/*.rs'.".into(),
            parameters: ParameterSchema::object().property(
                "pattern",
                PropertySchema::string().describe("Glob pattern relative to the workspace root."),
                true,
            ),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let pattern = str_arg(self.name(), &args, "pattern")?;
        let full = resolve(self.name(), &self.root, pattern)?;
        let paths = glob::glob(&full.to_string_lossy())
            .map_err(|e| invalid(self.name(), format!("bad pattern '{pattern}': {e}")))?;

        let mut matches: Vec<String> = paths
            .filter_map(Result::ok)
            .map(|p| relative(&self.root, &p))
            .take(MAX_GLOB_RESULTS)
            .collect();
        matches.sort();
        let display = format!("Found {} matching file(s).", matches.len());
        Ok(ToolResult::structured(json!(matches), display))
    }
}

pub struct SearchFileContentTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for SearchFileContentTool {
    fn name(&self) -> &str {
        "search_file_content"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Search workspace files for lines matching a regular expression.".into(),
            parameters: ParameterSchema::object()
                .property(
                    "pattern",
                    PropertySchema::string().describe("Regular expression to search for."),
                    true,
                )
                .property(
                    "include",
                    PropertySchema::string().describe("Glob restricting which files are searched."),
                    false,
                ),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let pattern = str_arg(self.name(), &args, "pattern")?;
        let regex = regex::Regex::new(pattern)
            .map_err(|e| invalid(self.name(), format!("bad regex '{pattern}': {e}")))?;
        let include = args
            .get("include")
            .and_then(|v| v.as_str())
            .unwrap_or("**/*");
        let files = glob::glob(&resolve(self.name(), &self.root, include)?.to_string_lossy())
            .map_err(|e| invalid(self.name(), format!("bad include '{include}': {e}")))?;

        let mut matches = Vec::new();
        'files: for path in files.filter_map(Result::ok).filter(|p| p.is_file()) {
            if ctx.is_cancelled() {
                return Err(ToolError::Cancelled {
                    name: self.name().to_string(),
                });
            }
            // Binary or unreadable files are skipped.
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}: {}", relative(&self.root, &path), idx + 1, line));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        break 'files;
                    }
                }
            }
        }

        let display = format!("Found {} match(es).", matches.len());
        if matches.is_empty() {
            return Ok(ToolResult::structured(json!("No matches found."), display));
        }
        Ok(ToolResult::structured(json!(matches.join("\n")), display))
    }
}

pub struct WriteFileTool {
    root: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        WRITE_FILE_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Write content to a workspace file, creating parent directories.".into(),
            parameters: ParameterSchema::object()
                .property("path", PropertySchema::string(), true)
                .property("content", PropertySchema::string(), true),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let path = resolve(self.name(), &self.root, str_arg(self.name(), &args, "path")?)?;
        let content = str_arg(self.name(), &args, "content")?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(self.name(), e))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| failed(self.name(), format!("{}: {e}", path.display())))?;
        Ok(ToolResult::text(format!(
            "Wrote {} bytes to {}.",
            content.len(),
            relative(&self.root, &path)
        )))
    }
}

/// Keeps no state of its own; the chat layer summarizes the submitted list.
pub struct WriteTodosTool;

#[async_trait]
impl Tool for WriteTodosTool {
    fn name(&self) -> &str {
        WRITE_TODOS_TOOL_NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Replace the current todo list. Each todo has a description and a status \
                          of pending, in_progress, completed or cancelled."
                .into(),
            parameters: ParameterSchema::object().property(
                "todos",
                PropertySchema::array_of(PropertySchema::new("object")),
                true,
            ),
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: ToolArgs) -> Result<ToolResult, ToolError> {
        let todos = args
            .get("todos")
            .and_then(|v| v.as_array())
            .ok_or_else(|| invalid(self.name(), "'todos' must be an array"))?;
        let lines: Vec<String> = todos
            .iter()
            .map(|todo| {
                let status = todo.get("status").and_then(|s| s.as_str()).unwrap_or("pending");
                let description = todo
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default();
                format!("[{status}] {description}")
            })
            .collect();
        Ok(ToolResult::structured(
            json!({ "todos": todos }),
            lines.join("\n"),
        ))
    }
}

/// Registry with every workspace tool rooted at `root`.
pub fn workspace_registry(root: &Path) -> Result<ToolRegistry, ToolError> {
    let root = root.to_path_buf();
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ListDirectoryTool { root: root.clone() }))?;
    registry.register(Arc::new(ReadFileTool { root: root.clone() }))?;
    registry.register(Arc::new(GlobTool { root: root.clone() }))?;
    registry.register(Arc::new(SearchFileContentTool { root: root.clone() }))?;
    registry.register(Arc::new(WriteFileTool { root }))?;
    registry.register(Arc::new(WriteTodosTool))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn args(value: serde_json::Value) -> ToolArgs {
        value.as_object().cloned().unwrap_or_default()
    }

    fn ctx() -> ToolContext {
        ToolContext::new("call-1", CancellationToken::new())
    }

    fn workspace() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn alpha() {}\n// beta\n")
            .expect("write lib");
        std::fs::write(dir.path().join("README.md"), "# demo\nalpha docs\n").expect("write readme");
        let registry = workspace_registry(dir.path()).expect("registry");
        (dir, registry)
    }

    async fn run(registry: &ToolRegistry, name: &str, value: serde_json::Value) -> Result<ToolResult, ToolError> {
        let tool = registry.get_tool(name).expect("tool registered");
        tool.execute(&ctx(), args(value)).await
    }

    #[tokio::test]
    async fn lists_directories_with_trailing_slash() {
        let (_dir, registry) = workspace();
        let result = run(&registry, "list_directory", json!({"path": "."}))
            .await
            .expect("listed");
        assert_eq!(result.llm_content, json!(["README.md", "src/"]));
    }

    #[tokio::test]
    async fn reads_line_windows() {
        let (_dir, registry) = workspace();
        let result = run(
            &registry,
            "read_file",
            json!({"path": "src/lib.rs", "offset": 1, "limit": 1}),
        )
        .await
        .expect("read");
        assert_eq!(result.llm_content, json!("// beta"));
    }

    #[tokio::test]
    async fn parent_hops_are_refused() {
        let (_dir, registry) = workspace();
        let err = run(&registry, "read_file", json!({"path": "../etc/passwd"}))
            .await
            .expect_err("outside workspace");
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn glob_and_search_report_relative_paths() {
        let (_dir, registry) = workspace();
        let globbed = run(&registry, "glob", json!({"pattern": "src/*.rs"}))
            .await
            .expect("glob");
        assert_eq!(globbed.llm_content, json!(["src/lib.rs"]));

        let found = run(&registry, "search_file_content", json!({"pattern": "alpha"}))
            .await
            .expect("search");
        let text = found.llm_content.as_str().unwrap_or_default().to_string();
        assert!(text.contains("README.md:2: alpha docs"));
        assert!(text.contains("src/lib.rs:1: pub fn alpha() {}"));
        assert_eq!(found.return_display, "Found 2 match(es).");
    }

    #[tokio::test]
    async fn write_file_creates_parents() {
        let (dir, registry) = workspace();
        run(
            &registry,
            "write_file",
            json!({"path": "docs/notes.md", "content": "hello"}),
        )
        .await
        .expect("written");
        let written = std::fs::read_to_string(dir.path().join("docs/notes.md")).expect("file");
        assert_eq!(written, "hello");
    }

    #[tokio::test]
    async fn write_todos_renders_statuses() {
        let (_dir, registry) = workspace();
        let result = run(
            &registry,
            "write_todos",
            json!({"todos": [
                {"description": "plan", "status": "completed"},
                {"description": "build", "status": "in_progress"}
            ]}),
        )
        .await
        .expect("todos");
        assert_eq!(result.return_display, "[completed] plan\n[in_progress] build");
    }
}
