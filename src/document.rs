//! Export/import documents and reusable batch templates
//!
//! A [`BatchDocument`] carries a whole batch (definition, lifecycle state and
//! error ledger) as JSON. A [`BatchTemplate`] keeps only the shape of a batch:
//! each parameter value is replaced by a `{{command_id.key}}` placeholder that
//! is bound again when the template is instantiated.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::lifecycle::Batch;
use crate::model::{
    BatchConfiguration, BatchDraft, Command, CommandId, CommandMetadata, CommandSpec, CommandType,
    Dependency, Priority,
};

/// Document format written by this crate
pub const FORMAT_VERSION: u32 = 1;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"^\{\{\s*([^{}\s]+)\s*\}\}$").unwrap();
}

/// Errors raised while reading documents or instantiating templates
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Document written by a newer or older format
    #[error("Unsupported document format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Records and commands disagree
    #[error("Document is inconsistent: {0}")]
    Inconsistent(String),

    /// A template placeholder had no binding
    #[error("No binding for placeholder {0}")]
    UnboundPlaceholder(String),

    /// Bound parameters do not fit the command type
    #[error("Invalid parameters for command {command_id}: {source}")]
    InvalidParameters {
        command_id: CommandId,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializable snapshot of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDocument {
    /// Format the document was written in
    pub format_version: u32,
    /// When the document was produced
    pub exported_at: DateTime<Utc>,
    /// The exported batch
    pub batch: Batch,
}

impl BatchDocument {
    /// Wrap a batch for export
    pub fn new(batch: Batch) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            exported_at: Utc::now(),
            batch,
        }
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and check a document
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let document: Self = serde_json::from_str(json)?;
        if document.format_version != FORMAT_VERSION {
            return Err(DocumentError::UnsupportedVersion {
                found: document.format_version,
                expected: FORMAT_VERSION,
            });
        }
        document.check()?;
        debug!(batch_id = %document.batch.id(), "batch document imported");
        Ok(document)
    }

    fn check(&self) -> Result<(), DocumentError> {
        let commands: BTreeSet<&str> = self.batch.commands().iter().map(|c| c.id.as_str()).collect();
        let recorded: BTreeSet<&str> = self.batch.records().map(|(id, _)| id.as_str()).collect();
        if commands != recorded {
            return Err(DocumentError::Inconsistent(
                "command records do not match the command list".to_string(),
            ));
        }
        if let Some(error) = self
            .batch
            .active_errors()
            .iter()
            .find(|e| !commands.contains(e.command_id.as_str()))
        {
            return Err(DocumentError::Inconsistent(format!(
                "active error for unknown command {}",
                error.command_id
            )));
        }
        Ok(())
    }

    /// Unwrap the imported batch
    pub fn into_batch(self) -> Batch {
        self.batch
    }
}

/// Command shape with placeholder parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateCommand {
    /// Command id, carried over unchanged
    pub id: CommandId,
    /// Command type used to rebuild typed parameters
    #[serde(rename = "type")]
    pub command_type: CommandType,
    /// Parameters, with `{{name}}` placeholders
    pub parameters: serde_json::Map<String, Value>,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Display metadata
    #[serde(default)]
    pub metadata: CommandMetadata,
}

/// Reusable batch definition without concrete parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTemplate {
    /// Format the template was written in
    pub format_version: u32,
    /// Batch configuration to instantiate with
    pub configuration: BatchConfiguration,
    /// Commands with placeholder parameters
    pub commands: Vec<TemplateCommand>,
    /// Dependency edges
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl BatchTemplate {
    /// Strip parameter values from a draft
    pub fn from_draft(draft: &BatchDraft) -> Self {
        Self::from_parts(&draft.commands, &draft.dependencies, &draft.configuration)
    }

    /// Strip parameter values from a batch definition
    pub fn from_batch(batch: &Batch) -> Self {
        Self::from_parts(batch.commands(), batch.dependencies(), batch.configuration())
    }

    fn from_parts(commands: &[Command], dependencies: &[Dependency], configuration: &BatchConfiguration) -> Self {
        let commands = commands
            .iter()
            .map(|command| TemplateCommand {
                id: command.id.clone(),
                command_type: command.command_type(),
                parameters: command
                    .spec
                    .parameters()
                    .into_iter()
                    .map(|(key, _)| {
                        let placeholder = Value::String(format!("{{{{{}.{}}}}}", command.id, key));
                        (key, placeholder)
                    })
                    .collect(),
                priority: command.priority,
                metadata: command.metadata.clone(),
            })
            .collect();

        Self {
            format_version: FORMAT_VERSION,
            configuration: configuration.clone(),
            commands,
            dependencies: dependencies.to_vec(),
        }
    }

    /// Placeholder names in declaration order, without braces
    pub fn placeholders(&self) -> Vec<String> {
        self.commands
            .iter()
            .flat_map(|c| c.parameters.values())
            .filter_map(placeholder_name)
            .map(str::to_string)
            .collect()
    }

    /// Bind every placeholder and rebuild a draft
    pub fn instantiate(&self, bindings: &HashMap<String, Value>) -> Result<BatchDraft, DocumentError> {
        let mut draft = BatchDraft::default().with_configuration(self.configuration.clone());

        for template in &self.commands {
            let mut parameters = serde_json::Map::with_capacity(template.parameters.len());
            for (key, value) in &template.parameters {
                let bound = match placeholder_name(value) {
                    Some(name) => bindings
                        .get(name)
                        .cloned()
                        .ok_or_else(|| DocumentError::UnboundPlaceholder(name.to_string()))?,
                    None => value.clone(),
                };
                parameters.insert(key.clone(), bound);
            }

            let spec = CommandSpec::from_parameters(template.command_type, parameters).map_err(|source| {
                DocumentError::InvalidParameters {
                    command_id: template.id.clone(),
                    source,
                }
            })?;

            draft = draft.add_command(Command {
                id: template.id.clone(),
                spec,
                priority: template.priority,
                metadata: template.metadata.clone(),
            });
        }

        for dependency in &self.dependencies {
            draft = draft.add_dependency(dependency.clone());
        }
        Ok(draft)
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, DocumentError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a template, checking its format version
    pub fn from_json(json: &str) -> Result<Self, DocumentError> {
        let template: Self = serde_json::from_str(json)?;
        if template.format_version != FORMAT_VERSION {
            return Err(DocumentError::UnsupportedVersion {
                found: template.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(template)
    }
}

fn placeholder_name(value: &Value) -> Option<&str> {
    let text = value.as_str()?;
    PLACEHOLDER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft() -> BatchDraft {
        BatchDraft::new("deploy")
            .add_command(Command::shell("build", "cargo"))
            .add_command(Command::wait("settle", 500))
            .depend("build", "settle")
    }

    #[test]
    fn test_placeholders_name_command_and_key() {
        let template = BatchTemplate::from_draft(&draft());
        let placeholders = template.placeholders();

        assert!(placeholders.contains(&"build.program".to_string()));
        assert!(placeholders.contains(&"settle.duration_ms".to_string()));
        assert_eq!(template.commands[1].parameters["duration_ms"], json!("{{settle.duration_ms}}"));
    }

    #[test]
    fn test_instantiate_requires_every_binding() {
        let template = BatchTemplate::from_draft(&draft());
        let mut bindings = HashMap::new();
        bindings.insert("build.program".to_string(), json!("make"));

        let err = template.instantiate(&bindings).unwrap_err();
        assert!(matches!(err, DocumentError::UnboundPlaceholder(name) if name == "settle.duration_ms"));
    }

    #[test]
    fn test_document_rejects_future_version() {
        let mut document = BatchDocument::new(Batch::new(draft()));
        document.format_version = 7;
        let json = document.to_json().unwrap();

        assert!(matches!(
            BatchDocument::from_json(&json),
            Err(DocumentError::UnsupportedVersion { found: 7, .. })
        ));
    }
}
