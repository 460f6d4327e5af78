//! The tool catalog a Kobold worker's tool loop invokes, filtered by its
//! agent type's permission mask (spec §4.5.3, §4.4.1, §4.6). Every
//! filesystem-touching tool routes through the sandbox before it reaches
//! disk or a child process.

use std::path::{Path, PathBuf};

use forge_common::ToolPermissionMask;
use serde_json::Value;

use crate::planning_context::provider::ToolSpec;
use crate::planning_context::sandbox::{self, Sandbox};

pub const READ_FILE: &str = "read_file";
pub const WRITE_FILE: &str = "write_file";
pub const RUN_COMMAND: &str = "run_command";
pub const REFLECT: &str = "reflect";
pub const COMPLETE_STEP: &str = "complete_step";

/// Build the tool catalog visible to a worker with the given permission
/// mask. `reflect` and `complete_step` are protocol tools, not
/// filesystem operations, so every agent type gets them regardless of
/// the mask.
pub fn catalog_for(mask: ToolPermissionMask) -> Vec<ToolSpec> {
    let mut tools = Vec::new();

    if mask.fs_read {
        tools.push(ToolSpec {
            name: READ_FILE.to_string(),
            description: "Read a UTF-8 text file inside the project workspace.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"],
            }),
        });
    }
    if mask.fs_write {
        tools.push(ToolSpec {
            name: WRITE_FILE.to_string(),
            description: "Create or overwrite a file inside the project workspace.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "overwrite": { "type": "boolean" },
                },
                "required": ["path", "content"],
            }),
        });
    }
    if mask.run_command {
        tools.push(ToolSpec {
            name: RUN_COMMAND.to_string(),
            description: "Run a command (argv array, no shell expansion) inside the workspace."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "program": { "type": "string" },
                    "args": { "type": "array", "items": { "type": "string" } },
                },
                "required": ["program"],
            }),
        });
    }

    tools.push(ToolSpec {
        name: REFLECT.to_string(),
        description: "Report a progress checkpoint on the current step.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "progress_percent": { "type": "number" },
                "files_done": { "type": "array", "items": { "type": "string" } },
                "blockers": { "type": "array", "items": { "type": "string" } },
                "confidence": { "type": "number" },
                "decision": { "type": "string", "enum": ["continue", "complete", "escalate"] },
                "notes": { "type": "string" },
            },
            "required": ["progress_percent", "confidence", "decision"],
        }),
    });
    tools.push(ToolSpec {
        name: COMPLETE_STEP.to_string(),
        description: "Declare the current step finished.".to_string(),
        input_schema: serde_json::json!({ "type": "object", "properties": {} }),
    });

    tools
}

/// A filesystem or process tool invocation failed. Distinct from a
/// malformed-input error so the worker can report a useful `tool_result`
/// back to the model instead of aborting the whole task.
#[derive(Debug, thiserror::Error)]
pub enum ToolDispatchError {
    #[error(transparent)]
    Sandbox(#[from] sandbox::SandboxError),
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid input for tool '{0}': missing or malformed '{1}'")]
    InvalidInput(String, String),
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
}

/// Dispatch a filesystem/process tool by name. Returns the string the
/// worker appends as the tool_result content. Callers route `reflect`
/// and `complete_step` elsewhere — those are protocol signals, not
/// sandboxed operations.
pub async fn dispatch_fs_tool(
    sandbox: &Sandbox,
    name: &str,
    input: &Value,
) -> Result<String, ToolDispatchError> {
    match name {
        READ_FILE => {
            let path = str_field(input, "path")?;
            let resolved = sandbox.resolve(Path::new(path))?;
            std::fs::read_to_string(&resolved).map_err(|e| ToolDispatchError::ReadFailed(resolved, e))
        }
        WRITE_FILE => {
            let path = str_field(input, "path")?;
            let content = str_field(input, "content")?;
            let overwrite = input.get("overwrite").and_then(Value::as_bool).unwrap_or(false);
            let written = sandbox::write_file(sandbox, Path::new(path), content, true, overwrite)?;
            Ok(format!("wrote {}", written.display()))
        }
        RUN_COMMAND => {
            let program = str_field(input, "program")?;
            let args: Vec<String> = input
                .get("args")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let output = sandbox::run_command(sandbox, program, &args, None).await?;
            Ok(output.combined_output)
        }
        other => Err(ToolDispatchError::UnknownTool(other.to_string())),
    }
}

fn str_field<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolDispatchError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolDispatchError::InvalidInput("tool call".to_string(), field.to_string()))
}
