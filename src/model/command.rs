//! Commands and their typed parameters

use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier of a command, unique within its batch
pub type CommandId = String;

lazy_static! {
    static ref URL_PATTERN: Regex = Regex::new(r"^https?://[^\s/$.?#][^\s]*$").unwrap();
    static ref ENV_KEY_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

const HTTP_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Command priority, ordered low < normal < high < emergency
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Ahead of normal work
    High,
    /// Runs first
    Emergency,
}

/// Operation kind of a command, derived from its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Program run with arguments
    Shell,
    /// Outbound HTTP call
    HttpRequest,
    /// File copy
    FileTransfer,
    /// Timed pause
    Wait,
    /// Inline script
    Script,
    /// Executor-defined operation
    Custom,
}

impl CommandType {
    /// Wire name of the command type
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Shell => "shell",
            CommandType::HttpRequest => "http_request",
            CommandType::FileTransfer => "file_transfer",
            CommandType::Wait => "wait",
            CommandType::Script => "script",
            CommandType::Custom => "custom",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schema violation found in a command's parameters
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterViolation {
    /// A required parameter is absent or blank
    #[error("required parameter missing: {0}")]
    Missing(String),

    /// A parameter has an unacceptable value
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ParameterViolation {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ParameterViolation::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Parameters for running a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellParams {
    /// Program to run
    pub program: String,
    /// Program arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Directory to run in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Extra environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Parameters for an outbound HTTP call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpRequestParams {
    /// HTTP method
    pub method: String,
    /// Target URL, `http` or `https`
    pub url: String,
    /// Request headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// JSON request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Parameters for copying a file between locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTransferParams {
    /// Path to copy from
    pub source: String,
    /// Path to copy to
    pub destination: String,
    /// Replace an existing destination
    #[serde(default)]
    pub overwrite: bool,
}

/// Parameters for a timed pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitParams {
    /// Pause length in milliseconds
    pub duration_ms: u64,
}

/// Parameters for an inline script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptParams {
    /// Script language, such as `python`
    pub language: String,
    /// Script source text
    pub source: String,
    /// Named script arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, Value>,
}

/// Executor-defined operation with free-form values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomParams {
    /// Operation name understood by the executor
    pub operation: String,
    /// Operation inputs
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub values: serde_json::Map<String, Value>,
}

/// Typed command parameters, tagged by command type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum CommandSpec {
    /// Run a program
    Shell(ShellParams),
    /// Call an HTTP endpoint
    HttpRequest(HttpRequestParams),
    /// Copy a file
    FileTransfer(FileTransferParams),
    /// Pause
    Wait(WaitParams),
    /// Run an inline script
    Script(ScriptParams),
    /// Executor-defined operation
    Custom(CustomParams),
}

impl CommandSpec {
    /// Command type of these parameters
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandSpec::Shell(_) => CommandType::Shell,
            CommandSpec::HttpRequest(_) => CommandType::HttpRequest,
            CommandSpec::FileTransfer(_) => CommandType::FileTransfer,
            CommandSpec::Wait(_) => CommandType::Wait,
            CommandSpec::Script(_) => CommandType::Script,
            CommandSpec::Custom(_) => CommandType::Custom,
        }
    }

    /// Check the parameters against their type's schema
    pub fn check(&self) -> Result<(), ParameterViolation> {
        match self {
            CommandSpec::Shell(p) => {
                if p.program.trim().is_empty() {
                    return Err(ParameterViolation::Missing("program".into()));
                }
                if let Some(key) = p.env.keys().find(|k| !ENV_KEY_PATTERN.is_match(k)) {
                    return Err(ParameterViolation::invalid("env", format!("bad variable name '{}'", key)));
                }
                Ok(())
            }
            CommandSpec::HttpRequest(p) => {
                if !HTTP_METHODS.contains(&p.method.to_ascii_uppercase().as_str()) {
                    return Err(ParameterViolation::invalid("method", format!("unsupported method '{}'", p.method)));
                }
                if !URL_PATTERN.is_match(&p.url) {
                    return Err(ParameterViolation::invalid("url", "expected an http(s) URL"));
                }
                Ok(())
            }
            CommandSpec::FileTransfer(p) => {
                if p.source.is_empty() {
                    return Err(ParameterViolation::Missing("source".into()));
                }
                if p.destination.is_empty() {
                    return Err(ParameterViolation::Missing("destination".into()));
                }
                if p.source == p.destination {
                    return Err(ParameterViolation::invalid("destination", "same as source"));
                }
                Ok(())
            }
            CommandSpec::Wait(p) => {
                if p.duration_ms == 0 {
                    return Err(ParameterViolation::invalid("duration_ms", "must be positive"));
                }
                Ok(())
            }
            CommandSpec::Script(p) => {
                if p.language.is_empty() {
                    return Err(ParameterViolation::Missing("language".into()));
                }
                if p.source.trim().is_empty() {
                    return Err(ParameterViolation::Missing("source".into()));
                }
                Ok(())
            }
            CommandSpec::Custom(p) => {
                if p.operation.is_empty() {
                    return Err(ParameterViolation::Missing("operation".into()));
                }
                Ok(())
            }
        }
    }

    /// Parameters as a flat JSON object
    pub fn parameters(&self) -> serde_json::Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut tagged)) => match tagged.remove("parameters") {
                Some(Value::Object(params)) => params,
                _ => serde_json::Map::new(),
            },
            _ => serde_json::Map::new(),
        }
    }

    /// Rebuild typed parameters from a command type and a flat object
    pub fn from_parameters(
        command_type: CommandType,
        parameters: serde_json::Map<String, Value>,
    ) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::json!({
            "type": command_type.as_str(),
            "parameters": parameters,
        }))
    }

    /// Merge top-level overrides into the parameters, keeping the command type.
    /// Keys the command type does not define are rejected.
    pub fn with_overrides(&self, overrides: &serde_json::Map<String, Value>) -> serde_json::Result<Self> {
        let mut params = self.parameters();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        Self::from_parameters(self.command_type(), params)
    }
}

/// Display-only command metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Labels for filtering
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A unit of work inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique id within the batch
    pub id: CommandId,
    /// Typed parameters
    #[serde(flatten)]
    pub spec: CommandSpec,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Display metadata
    #[serde(default)]
    pub metadata: CommandMetadata,
}

impl Command {
    /// Create a command with normal priority
    pub fn new(id: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            priority: Priority::Normal,
            metadata: CommandMetadata::default(),
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = Some(name.into());
        self
    }

    /// Add a display tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    /// Command type of this command
    pub fn command_type(&self) -> CommandType {
        self.spec.command_type()
    }

    /// Shorthand for a shell command
    pub fn shell(id: impl Into<String>, program: impl Into<String>) -> Self {
        Self::new(
            id,
            CommandSpec::Shell(ShellParams {
                program: program.into(),
                args: Vec::new(),
                working_dir: None,
                env: BTreeMap::new(),
            }),
        )
    }

    /// Shorthand for a wait command
    pub fn wait(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, CommandSpec::Wait(WaitParams { duration_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Emergency);
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::wait("pause", 250).with_priority(Priority::High);
        let value = serde_json::to_value(&cmd).unwrap();

        assert_eq!(value["id"], "pause");
        assert_eq!(value["type"], "wait");
        assert_eq!(value["parameters"]["duration_ms"], 250);
        assert_eq!(value["priority"], "high");
    }

    #[test]
    fn test_http_schema_check() {
        let bad_method = CommandSpec::HttpRequest(HttpRequestParams {
            method: "FETCH".into(),
            url: "https://example.com".into(),
            headers: BTreeMap::new(),
            body: None,
        });
        assert!(matches!(bad_method.check(), Err(ParameterViolation::Invalid { ref field, .. }) if field == "method"));

        let bad_url = CommandSpec::HttpRequest(HttpRequestParams {
            method: "get".into(),
            url: "ftp://example.com".into(),
            headers: BTreeMap::new(),
            body: None,
        });
        assert!(bad_url.check().is_err());

        let ok = CommandSpec::HttpRequest(HttpRequestParams {
            method: "post".into(),
            url: "https://example.com/hooks".into(),
            headers: BTreeMap::new(),
            body: Some(json!({"a": 1})),
        });
        assert!(ok.check().is_ok());
    }

    #[test]
    fn test_shell_rejects_empty_program() {
        let cmd = Command::shell("s", "  ");
        assert_eq!(cmd.spec.check(), Err(ParameterViolation::Missing("program".into())));
    }

    #[test]
    fn test_overrides_keep_type() {
        let cmd = Command::wait("w", 10);
        let mut overrides = serde_json::Map::new();
        overrides.insert("duration_ms".into(), json!(500));

        let patched = cmd.spec.with_overrides(&overrides).unwrap();
        assert_eq!(patched, CommandSpec::Wait(WaitParams { duration_ms: 500 }));
    }

    #[test]
    fn test_overrides_with_wrong_shape_fail() {
        let cmd = Command::wait("w", 10);
        let mut overrides = serde_json::Map::new();
        overrides.insert("duration_ms".into(), json!("soon"));

        assert!(cmd.spec.with_overrides(&overrides).is_err());
    }

    #[test]
    fn test_overrides_with_unknown_key_fail() {
        let cmd = Command::wait("w", 10);
        let mut overrides = serde_json::Map::new();
        overrides.insert("timeout_ms".into(), json!(5_000));

        let err = cmd.spec.with_overrides(&overrides).unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }
}
