//! Hook command protocol
//!
//! Hook scripts talk back through stdout: each non-blank line either
//! starts with a known `PREFIX ` marker or counts as plain output.
//! Prefixes are tested longest-first so `SYSTEM_FILE` wins over
//! `SYSTEM`. A `CONDITION BACKEND|MODEL` marker splits everything after
//! it into a block applied only if the requested switch validates.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

/// Cap on file content pulled in by the *_FILE command variants.
pub const FILE_VALUE_MAX_BYTES: usize = 20_000;

/// Namespace auto-prefixed onto bare ENV keys.
pub const ENV_NAMESPACE: &str = "OTTO_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    Backend,
    Model,
}

/// One typed directive parsed from hook stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum HookCommand {
    Env { key: String, value: String },
    System(String),
    SystemFile(PathBuf),
    Model(String),
    Backend(String),
    BaseUrl(String),
    ApiKeyEnvVar(String),
    Set { namespace: String, name: String, value: String },
    SetFile { namespace: String, name: String, path: PathBuf },
    SetTempFile { namespace: String, name: String, path: PathBuf },
    Prefill(String),
    Call(String),
    Condition(ConditionKind),
    /// Implicit: any non-blank line matching no prefix.
    Output(String),
}

/// Parse hook stdout into typed commands, one per non-blank line.
pub fn parse(stdout: &str) -> Vec<HookCommand> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> HookCommand {
    // Longer/more specific prefixes first.
    if let Some(rest) = line.strip_prefix("SYSTEM_FILE ") {
        return HookCommand::SystemFile(PathBuf::from(rest.trim()));
    }
    if let Some(rest) = line.strip_prefix("SYSTEM ") {
        return HookCommand::System(rest.to_string());
    }
    if let Some(rest) = line.strip_prefix("SET_TEMP_FILE ") {
        return parse_set(rest, SetVariant::TempFile, line);
    }
    if let Some(rest) = line.strip_prefix("SET_FILE ") {
        return parse_set(rest, SetVariant::File, line);
    }
    if let Some(rest) = line.strip_prefix("SET ") {
        return parse_set(rest, SetVariant::Value, line);
    }
    if let Some(rest) = line.strip_prefix("ENV ") {
        let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
        let key = key.trim();
        let key = if key.starts_with(ENV_NAMESPACE) {
            key.to_string()
        } else {
            format!("{ENV_NAMESPACE}{key}")
        };
        return HookCommand::Env {
            key,
            value: value.to_string(),
        };
    }
    if let Some(rest) = line.strip_prefix("MODEL ") {
        return HookCommand::Model(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("BACKEND ") {
        return HookCommand::Backend(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("BASE_URL ") {
        return HookCommand::BaseUrl(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("API_KEY_ENV_VAR ") {
        return HookCommand::ApiKeyEnvVar(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("PREFILL ") {
        return HookCommand::Prefill(rest.to_string());
    }
    if let Some(rest) = line.strip_prefix("CALL ") {
        return HookCommand::Call(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("CONDITION ") {
        return match rest.trim() {
            "BACKEND" => HookCommand::Condition(ConditionKind::Backend),
            "MODEL" => HookCommand::Condition(ConditionKind::Model),
            other => {
                warn!(marker = other, "unknown CONDITION marker, treating line as output");
                HookCommand::Output(rest.to_string())
            }
        };
    }
    HookCommand::Output(line.to_string())
}

enum SetVariant {
    Value,
    File,
    TempFile,
}

fn parse_set(rest: &str, variant: SetVariant, original: &str) -> HookCommand {
    let Some((target, value)) = rest.split_once('=') else {
        warn!(line = original, "SET line missing '=', treating as output");
        return HookCommand::Output(original.to_string());
    };
    let Some((namespace, name)) = target.split_once(':') else {
        warn!(line = original, "SET target missing 'NAMESPACE:NAME', treating as output");
        return HookCommand::Output(original.to_string());
    };
    let namespace = namespace.trim().to_string();
    let name = name.trim().to_string();
    match variant {
        SetVariant::Value => HookCommand::Set {
            namespace,
            name,
            value: value.to_string(),
        },
        SetVariant::File => HookCommand::SetFile {
            namespace,
            name,
            path: PathBuf::from(value.trim()),
        },
        SetVariant::TempFile => HookCommand::SetTempFile {
            namespace,
            name,
            path: PathBuf::from(value.trim()),
        },
    }
}

/// Aggregated view of one command batch. SYSTEM/output lines are
/// newline-joined; the switch-related fields are last-wins.
#[derive(Debug, Clone, Default)]
pub struct AppliedCommands {
    pub env: Vec<(String, String)>,
    pub system: Option<String>,
    pub output: Option<String>,
    pub model: Option<String>,
    pub backend: Option<String>,
    pub base_url: Option<String>,
    pub api_key_env_var: Option<String>,
    pub prefill: Option<String>,
    /// Prompt-variable assignments, keyed `namespace:name`.
    pub prompt_vars: Vec<(String, String)>,
    pub calls: Vec<String>,
    pub conditional: Option<Box<ConditionalBlock>>,
}

#[derive(Debug, Clone)]
pub struct ConditionalBlock {
    pub kind: ConditionKind,
    pub commands: AppliedCommands,
}

impl AppliedCommands {
    pub fn requests_switch(&self) -> bool {
        self.backend.is_some() || self.model.is_some()
    }
}

/// Aggregate a command batch. File-reading variants resolve here; a
/// `CONDITION` marker sends the rest of the batch into `conditional`,
/// recursively.
pub fn apply(commands: &[HookCommand]) -> AppliedCommands {
    let mut out = AppliedCommands::default();
    let mut system_lines: Vec<String> = Vec::new();
    let mut output_lines: Vec<String> = Vec::new();

    for (index, command) in commands.iter().enumerate() {
        match command {
            HookCommand::Env { key, value } => out.env.push((key.clone(), value.clone())),
            HookCommand::System(text) => system_lines.push(text.clone()),
            HookCommand::SystemFile(path) => match read_capped(path, false) {
                Ok(content) => system_lines.push(content),
                Err(e) => warn!(path = %path.display(), "SYSTEM_FILE unreadable: {}", e),
            },
            HookCommand::Model(model) => out.model = Some(model.clone()),
            HookCommand::Backend(backend) => out.backend = Some(backend.clone()),
            HookCommand::BaseUrl(url) => out.base_url = Some(url.clone()),
            HookCommand::ApiKeyEnvVar(var) => out.api_key_env_var = Some(var.clone()),
            HookCommand::Prefill(text) => out.prefill = Some(text.clone()),
            HookCommand::Set { namespace, name, value } => {
                out.prompt_vars.push((format!("{namespace}:{name}"), value.clone()));
            }
            HookCommand::SetFile { namespace, name, path } => match read_capped(path, false) {
                Ok(content) => out.prompt_vars.push((format!("{namespace}:{name}"), content)),
                Err(e) => warn!(path = %path.display(), "SET_FILE unreadable: {}", e),
            },
            HookCommand::SetTempFile { namespace, name, path } => match read_capped(path, true) {
                Ok(content) => out.prompt_vars.push((format!("{namespace}:{name}"), content)),
                Err(e) => warn!(path = %path.display(), "SET_TEMP_FILE unreadable: {}", e),
            },
            HookCommand::Call(call) => out.calls.push(call.clone()),
            HookCommand::Output(line) => output_lines.push(line.clone()),
            HookCommand::Condition(kind) => {
                out.conditional = Some(Box::new(ConditionalBlock {
                    kind: *kind,
                    commands: apply(&commands[index + 1..]),
                }));
                break;
            }
        }
    }

    if !system_lines.is_empty() {
        out.system = Some(system_lines.join("\n"));
    }
    if !output_lines.is_empty() {
        out.output = Some(output_lines.join("\n"));
    }
    out
}

/// Read a file capped at `FILE_VALUE_MAX_BYTES`, with a truncation
/// marker; the temp variant deletes the source after a successful read.
fn read_capped(path: &Path, delete_after: bool) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let content = if bytes.len() > FILE_VALUE_MAX_BYTES {
        let mut boundary = FILE_VALUE_MAX_BYTES;
        let text = String::from_utf8_lossy(&bytes);
        while boundary > 0 && !text.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!(
            "{}\n[truncated at {} bytes]",
            &text[..boundary],
            FILE_VALUE_MAX_BYTES
        )
    } else {
        String::from_utf8_lossy(&bytes).to_string()
    };

    if delete_after {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), "failed to delete temp file: {}", e);
        }
    }
    Ok(content)
}

/// Parse a CALL line: `toolName key=value ...`. Each value is
/// JSON-decoded, falling back to the raw string.
pub fn parse_call_line(line: &str) -> Option<(String, Map<String, Value>)> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?.to_string();
    let mut args = Map::new();
    for part in parts {
        let (key, raw) = part.split_once('=')?;
        let value = serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.to_string(), value);
    }
    Some((name, args))
}

/// Canonical signature for CALL deduplication: tool name plus arguments
/// with sorted keys.
pub fn call_signature(name: &str, args: &Map<String, Value>) -> String {
    format!("{}{}", name, Value::Object(args.clone()))
}
