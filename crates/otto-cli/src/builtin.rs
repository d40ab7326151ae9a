//! Built-in tools wired into the CLI's registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use otto_core::ai::types::{ToolParameters, ToolSchema};
use otto_core::tools::{Tool, ToolOutcome, ToolRegistry};

fn schema(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolSchema {
    let properties = match properties {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        parameters: ToolParameters {
            schema_type: "object".to_string(),
            properties,
            required: required.iter().map(|s| s.to_string()).collect(),
        },
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn schema(&self) -> ToolSchema {
        schema(
            "read_file",
            "Read a text file and return its contents",
            json!({ "path": { "type": "string", "description": "Path to the file" } }),
            &["path"],
        )
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let Some(path) = str_arg(&args, "path") else {
            return ToolOutcome::error("missing 'path'");
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => ToolOutcome::success(contents),
            Err(e) => ToolOutcome::error(format!("failed to read {path}: {e}")),
        }
    }
}

struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn schema(&self) -> ToolSchema {
        schema(
            "write_file",
            "Write content to a file, replacing it if it exists",
            json!({
                "path": { "type": "string", "description": "Path to the file" },
                "content": { "type": "string", "description": "Content to write" }
            }),
            &["path", "content"],
        )
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let (Some(path), Some(content)) = (str_arg(&args, "path"), str_arg(&args, "content"))
        else {
            return ToolOutcome::error("missing 'path' or 'content'");
        };
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutcome::error(format!("failed to create {}: {e}", parent.display()));
                }
            }
        }
        match tokio::fs::write(path, content).await {
            Ok(()) => ToolOutcome::success(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolOutcome::error(format!("failed to write {path}: {e}")),
        }
    }
}

struct ListDir;

#[async_trait]
impl Tool for ListDir {
    fn schema(&self) -> ToolSchema {
        schema(
            "list_dir",
            "List the entries of a directory",
            json!({ "path": { "type": "string", "description": "Directory path, defaults to '.'" } }),
            &[],
        )
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let path = str_arg(&args, "path").unwrap_or(".");
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) => return ToolOutcome::error(format!("failed to list {path}: {e}")),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        ToolOutcome::success(names.join("\n"))
    }
}

struct RunCommand;

#[async_trait]
impl Tool for RunCommand {
    fn schema(&self) -> ToolSchema {
        schema(
            "run_command",
            "Run a shell command and return its combined output",
            json!({ "command": { "type": "string", "description": "Shell command to run" } }),
            &["command"],
        )
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let Some(command) = str_arg(&args, "command") else {
            return ToolOutcome::error("missing 'command'");
        };
        let output = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => return ToolOutcome::error(format!("failed to run command: {e}")),
        };
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push_str("\n[stderr]\n");
            text.push_str(&stderr);
        }
        if output.status.success() {
            ToolOutcome::success(text)
        } else {
            ToolOutcome::error(format!("exit {}\n{}", output.status, text))
        }
    }
}

pub fn registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFile));
    registry.register(Arc::new(WriteFile));
    registry.register(Arc::new(ListDir));
    registry.register(Arc::new(RunCommand));
    registry
}
