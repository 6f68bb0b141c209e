use crate::fields::{FieldMap, field, require_field};
use crate::SCHEMA_VERSION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::model::ErrorDetail;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing message field: {0}")]
    MissingField(String),
    #[error("invalid value for field {name}: {reason}")]
    InvalidField { name: String, reason: String },
    #[error("unsupported schema version {found} (supported <= {supported})")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A dispatched unit of work. The config is already resolved: workers
/// never look up upstream outputs themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub execution_id: Uuid,
    pub node_id: String,
    pub handler: String,
    pub resolved_config: Value,
    pub retry_count: u32,
    pub schema_version: u32,
}

impl TaskMessage {
    pub fn new(
        execution_id: Uuid,
        node_id: impl Into<String>,
        handler: impl Into<String>,
        resolved_config: Value,
        retry_count: u32,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            handler: handler.into(),
            resolved_config,
            retry_count,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn to_fields(&self) -> FieldMap {
        vec![
            ("execution_id".to_string(), self.execution_id.to_string()),
            ("node_id".to_string(), self.node_id.clone()),
            ("handler".to_string(), self.handler.clone()),
            (
                "config".to_string(),
                self.resolved_config.to_string(),
            ),
            ("retry_count".to_string(), self.retry_count.to_string()),
            (
                "schema_version".to_string(),
                self.schema_version.to_string(),
            ),
        ]
    }

    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, ProtocolError> {
        let schema_version = parse_schema_version(fields)?;
        Ok(Self {
            execution_id: parse_uuid(fields, "execution_id")?,
            node_id: require_field(fields, "node_id")?.to_string(),
            handler: require_field(fields, "handler")?.to_string(),
            resolved_config: parse_json(fields, "config")?,
            retry_count: parse_u32(fields, "retry_count")?,
            schema_version,
        })
    }
}

/// Outcome of one task attempt, published by workers and consumed by the
/// orchestrator group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: CompletionStatus,
    pub output: Option<Value>,
    pub error: Option<ErrorDetail>,
    pub schema_version: u32,
}

impl CompletionMessage {
    pub fn completed(execution_id: Uuid, node_id: impl Into<String>, output: Option<Value>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            status: CompletionStatus::Completed,
            output,
            error: None,
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn failed(execution_id: Uuid, node_id: impl Into<String>, error: ErrorDetail) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            status: CompletionStatus::Failed,
            output: None,
            error: Some(error),
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn to_fields(&self) -> FieldMap {
        let mut fields = vec![
            ("execution_id".to_string(), self.execution_id.to_string()),
            ("node_id".to_string(), self.node_id.clone()),
            ("status".to_string(), self.status.as_str().to_string()),
        ];
        if let Some(output) = &self.output {
            fields.push(("output".to_string(), output.to_string()));
        }
        if let Some(error) = &self.error {
            fields.push((
                "error".to_string(),
                serde_json::to_string(error).unwrap_or_default(),
            ));
        }
        fields.push((
            "schema_version".to_string(),
            self.schema_version.to_string(),
        ));
        fields
    }

    pub fn from_fields(fields: &[(String, String)]) -> Result<Self, ProtocolError> {
        let schema_version = parse_schema_version(fields)?;
        let status = match require_field(fields, "status")? {
            "completed" => CompletionStatus::Completed,
            "failed" => CompletionStatus::Failed,
            other => {
                return Err(ProtocolError::InvalidField {
                    name: "status".to_string(),
                    reason: format!("unknown completion status: {other}"),
                });
            }
        };

        let output = match field(fields, "output") {
            Some(raw) if !raw.is_empty() => Some(parse_json_text(raw, "output")?),
            _ => None,
        };
        let error = match field(fields, "error") {
            Some(raw) if !raw.is_empty() => {
                Some(serde_json::from_str::<ErrorDetail>(raw).map_err(|e| {
                    ProtocolError::InvalidField {
                        name: "error".to_string(),
                        reason: e.to_string(),
                    }
                })?)
            }
            _ => None,
        };

        Ok(Self {
            execution_id: parse_uuid(fields, "execution_id")?,
            node_id: require_field(fields, "node_id")?.to_string(),
            status,
            output,
            error,
            schema_version,
        })
    }
}

fn parse_schema_version(fields: &[(String, String)]) -> Result<u32, ProtocolError> {
    let found = parse_u32(fields, "schema_version")?;
    if found > SCHEMA_VERSION {
        return Err(ProtocolError::UnsupportedSchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(found)
}

fn parse_uuid(fields: &[(String, String)], name: &str) -> Result<Uuid, ProtocolError> {
    require_field(fields, name)?
        .parse()
        .map_err(|e: uuid::Error| ProtocolError::InvalidField {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn parse_u32(fields: &[(String, String)], name: &str) -> Result<u32, ProtocolError> {
    require_field(fields, name)?
        .parse()
        .map_err(|e: std::num::ParseIntError| ProtocolError::InvalidField {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn parse_json(fields: &[(String, String)], name: &str) -> Result<Value, ProtocolError> {
    parse_json_text(require_field(fields, name)?, name)
}

fn parse_json_text(raw: &str, name: &str) -> Result<Value, ProtocolError> {
    serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidField {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
