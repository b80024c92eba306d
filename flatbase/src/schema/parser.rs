use super::types::FieldDefinition;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Field declarations kept in a `<collection>.schema.yaml` sidecar next to the data file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredSchema {
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl DeclaredSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Parse a schema sidecar file into a DeclaredSchema
pub async fn parse_declared_schema(path: &Path) -> Result<DeclaredSchema> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_declared_schema_str(&content)
}

/// Parse a schema sidecar YAML string into a DeclaredSchema
pub fn parse_declared_schema_str(content: &str) -> Result<DeclaredSchema> {
    let schema: DeclaredSchema = serde_yaml::from_str(content)?;
    Ok(schema)
}

pub fn render_declared_schema(schema: &DeclaredSchema) -> Result<String> {
    Ok(serde_yaml::to_string(schema)?)
}
