//! Tools exposed to the model and their execution against a sandbox.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::message::{ToolCall, ToolSpec};
use crate::sandbox::{CommandRunner, SandboxFs};
use crate::util::{shorten_path, truncate_str};

pub const WRITE_FILE: &str = "write_file";
pub const READ_FILE: &str = "read_file";
pub const LIST_FILES: &str = "list_files";
pub const DELETE_FILE: &str = "delete_file";
pub const RUN_COMMAND: &str = "run_command";
pub const CREATE_PLAN: &str = "create_plan";

/// Longest tool output handed back to the model.
const MAX_TOOL_OUTPUT: usize = 50_000;

/// Which tools a phase may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    /// Full file and command access for code generation.
    Generation,
    /// Error fixing: no deletes.
    Fixing,
}

impl ToolSet {
    pub fn names(&self) -> &'static [&'static str] {
        match self {
            Self::Generation => &[WRITE_FILE, READ_FILE, LIST_FILES, DELETE_FILE, RUN_COMMAND],
            Self::Fixing => &[READ_FILE, WRITE_FILE, LIST_FILES, RUN_COMMAND],
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.names().iter().filter_map(|n| tool_spec(n)).collect()
    }

    pub fn allows(&self, name: &str) -> bool {
        self.names().contains(&name)
    }
}

fn spec(name: &str, description: &str, input_schema: Value) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

pub fn tool_spec(name: &str) -> Option<ToolSpec> {
    let path_only = |desc: &str| {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string", "description": desc}},
            "required": ["path"],
        })
    };
    let s = match name {
        WRITE_FILE => spec(
            WRITE_FILE,
            "Create or overwrite a file in the project. Parent directories are created.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the project root"},
                    "content": {"type": "string", "description": "Complete file contents"},
                },
                "required": ["path", "content"],
            }),
        ),
        READ_FILE => spec(
            READ_FILE,
            "Read a file from the project.",
            path_only("Path relative to the project root"),
        ),
        LIST_FILES => spec(
            LIST_FILES,
            "List project files, optionally under a directory. Dependency and build directories are skipped.",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string", "description": "Directory relative to the project root"}},
            }),
        ),
        DELETE_FILE => spec(
            DELETE_FILE,
            "Delete a file from the project.",
            path_only("Path relative to the project root"),
        ),
        RUN_COMMAND => spec(
            RUN_COMMAND,
            "Run a single command in the project directory. Only package manager, node and basic file utilities are allowed; pipes, redirection, chaining and variable expansion are rejected.",
            json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"],
            }),
        ),
        CREATE_PLAN => plan_tool(),
        _ => return None,
    };
    Some(s)
}

/// The structured planning tool. Planning forces a call to it.
pub fn plan_tool() -> ToolSpec {
    spec(
        CREATE_PLAN,
        "Record the architecture plan for the application.",
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "models": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "fields": {"type": "array", "items": {"type": "string"}},
                        },
                        "required": ["name"],
                    },
                },
                "routes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "method": {"type": "string"},
                            "path": {"type": "string"},
                            "description": {"type": "string"},
                        },
                        "required": ["method", "path"],
                    },
                },
                "components": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "description": {"type": "string"},
                        },
                        "required": ["name"],
                    },
                },
            },
            "required": ["models", "routes", "components"],
        }),
    )
}

fn str_arg<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(|v| v.as_str())
}

/// One-line human-readable reason shown next to a tool call.
pub fn describe_tool_call(name: &str, input: &Value) -> String {
    let path = || {
        str_arg(input, "path")
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        WRITE_FILE => format!("Creating: {}", path()),
        READ_FILE => format!("Reading: {}", path()),
        DELETE_FILE => format!("Deleting: {}", path()),
        LIST_FILES => match str_arg(input, "path") {
            Some(dir) if !dir.is_empty() => format!("Listing: {}", shorten_path(dir)),
            _ => "Listing project files".to_string(),
        },
        RUN_COMMAND => {
            let cmd = str_arg(input, "command")
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        CREATE_PLAN => "Planning architecture".to_string(),
        other => format!("Using: {}", other),
    }
}

/// A file the tool wrote, mirrored to the record store by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub output: String,
    pub is_error: bool,
    pub written: Option<WrittenFile>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
            written: None,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
            written: None,
        }
    }
}

/// Executes model tool calls. Failures are reported in the outcome, never
/// as an `Err`: a failed tool call does not stop generation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutcome;
}

/// Tool executor bound to one session sandbox.
pub struct SandboxTools {
    fs: SandboxFs,
    runner: Arc<dyn CommandRunner>,
    set: ToolSet,
}

impl SandboxTools {
    pub fn new(fs: SandboxFs, runner: Arc<dyn CommandRunner>, set: ToolSet) -> Self {
        Self { fs, runner, set }
    }

    pub fn set(&self) -> ToolSet {
        self.set
    }

    async fn write_file(&self, input: &Value) -> ToolOutcome {
        let (Some(path), Some(content)) = (str_arg(input, "path"), str_arg(input, "content")) else {
            return ToolOutcome::error("write_file requires 'path' and 'content'");
        };
        match self.fs.write_file(path, content).await {
            Ok(rel) => ToolOutcome {
                output: format!("Wrote {} ({} bytes)", rel, content.len()),
                is_error: false,
                written: Some(WrittenFile {
                    path: rel,
                    content: content.to_string(),
                }),
            },
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }

    async fn read_file(&self, input: &Value) -> ToolOutcome {
        let Some(path) = str_arg(input, "path") else {
            return ToolOutcome::error("read_file requires 'path'");
        };
        match self.fs.read_file(path).await {
            Ok(content) => ToolOutcome::ok(truncate_str(&content, MAX_TOOL_OUTPUT)),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }

    fn list_files(&self, input: &Value) -> ToolOutcome {
        match self.fs.list_files(str_arg(input, "path")) {
            Ok(files) if files.is_empty() => ToolOutcome::ok("(no files)"),
            Ok(files) => ToolOutcome::ok(files.join("\n")),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }

    async fn delete_file(&self, input: &Value) -> ToolOutcome {
        let Some(path) = str_arg(input, "path") else {
            return ToolOutcome::error("delete_file requires 'path'");
        };
        match self.fs.delete_file(path).await {
            Ok(rel) => ToolOutcome::ok(format!("Deleted {}", rel)),
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }

    async fn run_command(&self, input: &Value, cancel: &CancellationToken) -> ToolOutcome {
        let Some(command) = str_arg(input, "command") else {
            return ToolOutcome::error("run_command requires 'command'");
        };
        match self.runner.run(command, cancel).await {
            Ok(out) if out.cancelled => ToolOutcome::error("Command cancelled"),
            Ok(out) if out.timed_out => {
                ToolOutcome::error(format!("Command timed out after {:?}", out.duration))
            }
            Ok(out) => {
                let code = out
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string());
                let body = truncate_str(&out.combined_output(), MAX_TOOL_OUTPUT);
                let text = format!("Exit code: {}\n{}", code, body);
                if out.success() {
                    ToolOutcome::ok(text)
                } else {
                    ToolOutcome::error(text)
                }
            }
            Err(e) => ToolOutcome::error(e.to_string()),
        }
    }
}

#[async_trait]
impl ToolExecutor for SandboxTools {
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutcome {
        if !self.set.allows(&call.name) {
            return ToolOutcome::error(format!("Tool '{}' is not available in this phase", call.name));
        }
        match call.name.as_str() {
            WRITE_FILE => self.write_file(&call.input).await,
            READ_FILE => self.read_file(&call.input).await,
            LIST_FILES => self.list_files(&call.input),
            DELETE_FILE => self.delete_file(&call.input).await,
            RUN_COMMAND => self.run_command(&call.input, cancel).await,
            other => ToolOutcome::error(format!("Unknown tool '{}'", other)),
        }
    }
}
