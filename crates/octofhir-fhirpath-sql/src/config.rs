//! Compiler configuration.
//!
//! Configuration can be specified in `octofhir.toml` under the
//! `[fhirpath_sql]` section.
//!
//! # Example Configuration
//!
//! ```toml
//! [fhirpath_sql]
//! resource_table = "patient"
//! resource_column = "resource"
//! resource_type = "Patient"
//! external_tables = ["patient", "terminology"]
//! dialect = "postgres"
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dialect::{DialectKind, SqlDialect};
use crate::{Error, Result};

/// Settings shared by the translator, the CTE builder and the executor.
///
/// A compiled query always reads from exactly one logical root table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Table holding one JSON document per row.
    /// Default: "resource"
    #[serde(default = "default_resource_table")]
    pub resource_table: String,

    /// Column identifying a document.
    /// Default: "id"
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Column holding the JSON document.
    /// Default: "resource"
    #[serde(default = "default_resource_column")]
    pub resource_column: String,

    /// Resource type stored in the table. A leading identifier equal to it
    /// names the root rather than a field.
    #[serde(default)]
    pub resource_type: Option<String>,

    /// Tables CTEs may depend on besides other CTEs.
    /// The resource table is always included.
    #[serde(default)]
    pub external_tables: Vec<String>,

    /// Target database.
    /// Default: postgres
    #[serde(default)]
    pub dialect: DialectKind,
}

fn default_resource_table() -> String {
    "resource".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_resource_column() -> String {
    "resource".to_string()
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            resource_table: default_resource_table(),
            id_column: default_id_column(),
            resource_column: default_resource_column(),
            resource_type: None,
            external_tables: Vec::new(),
            dialect: DialectKind::default(),
        }
    }
}

impl CompilerConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text is not valid TOML for this
    /// structure or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a table or column name is empty.
    pub fn validate(&self) -> Result<()> {
        let names = [
            ("resource_table", &self.resource_table),
            ("id_column", &self.id_column),
            ("resource_column", &self.resource_column),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
        }
        if self.external_tables.iter().any(|t| t.trim().is_empty()) {
            return Err(Error::Config(
                "external_tables must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_resource_table(mut self, table: impl Into<String>) -> Self {
        self.resource_table = table.into();
        self
    }

    #[must_use]
    pub fn with_id_column(mut self, column: impl Into<String>) -> Self {
        self.id_column = column.into();
        self
    }

    #[must_use]
    pub fn with_resource_column(mut self, column: impl Into<String>) -> Self {
        self.resource_column = column.into();
        self
    }

    #[must_use]
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    #[must_use]
    pub fn with_external_table(mut self, table: impl Into<String>) -> Self {
        self.external_tables.push(table.into());
        self
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: DialectKind) -> Self {
        self.dialect = dialect;
        self
    }

    /// Instantiate the configured dialect.
    pub fn dialect(&self) -> Arc<dyn SqlDialect> {
        self.dialect.create()
    }

    /// External tables including the resource table.
    pub fn external_table_set(&self) -> BTreeSet<String> {
        let mut tables: BTreeSet<String> = self.external_tables.iter().cloned().collect();
        tables.insert(self.resource_table.clone());
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CompilerConfig::default();
        assert_eq!(config.resource_table, "resource");
        assert_eq!(config.id_column, "id");
        assert_eq!(config.resource_column, "resource");
        assert!(config.resource_type.is_none());
        assert_eq!(config.dialect, DialectKind::Postgres);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_external_table_set_contains_resource_table() {
        let config = CompilerConfig::default()
            .with_resource_table("patient")
            .with_external_table("terminology");
        let tables: Vec<_> = config.external_table_set().into_iter().collect();
        assert_eq!(tables, vec!["patient", "terminology"]);
    }

    #[test]
    fn test_deserialize_from_toml() {
        let toml = r#"
            resource_table = "observation"
            resource_type = "Observation"
            dialect = "duckdb"
        "#;

        let config = CompilerConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.resource_table, "observation");
        assert_eq!(config.resource_type.as_deref(), Some("Observation"));
        assert_eq!(config.dialect, DialectKind::DuckDb);
        assert_eq!(config.id_column, "id");
    }

    #[test]
    fn test_invalid_config() {
        let err = CompilerConfig::from_toml_str("resource_table = \"\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = CompilerConfig::from_toml_str("dialect = \"oracle\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
