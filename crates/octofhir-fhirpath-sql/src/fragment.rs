//! SQL fragments, the translator's intermediate representation.

use std::collections::BTreeMap;

use indexmap::IndexSet;
use serde_json::Value;

use crate::{Error, Result};

/// Alias of the source table or CTE inside every generated query.
pub const SOURCE_ALIAS: &str = "src";
/// Alias of the document-level table that regrouped element rows join back to.
pub const DOCUMENT_ALIAS: &str = "doc";
/// Alias of the element relation produced by unnesting.
pub const ELEMENT_ALIAS: &str = "elem";
/// Column holding the value computed by a CTE.
pub const RESULT_COLUMN: &str = "result";
/// Per-document element position of unnested rows.
pub const ITEM_INDEX_COLUMN: &str = "item_index";

/// Metadata key for the column alias the fragment result is projected as.
pub const RESULT_ALIAS: &str = "result_alias";
/// Metadata key for the array expression an unnesting fragment iterates.
pub const ARRAY_COLUMN: &str = "array_column";
/// Metadata key for the row filter of an unnesting fragment.
pub const FILTER_CONDITION: &str = "filter_condition";
/// Metadata key marking that the source already has one row per element.
pub const SOURCE_ELEMENT_ROWS: &str = "source_element_rows";
/// Metadata key naming the document-level table an aggregate regroups onto.
pub const DOCUMENT_TABLE: &str = "document_table";
/// Metadata key marking a result that is plain text rather than JSON.
pub const IS_JSON_STRING: &str = "is_json_string";
pub const DISCRIMINATOR_FIELDS: &str = "discriminator_fields";
pub const LITERAL_TYPE: &str = "literal_type";
pub const FUNCTION: &str = "function";
pub const RESULT_TYPE: &str = "result_type";

/// One emitted SQL expression plus the bookkeeping needed to turn it into a CTE.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFragment {
    expression: String,
    source_table: String,
    requires_unnest: bool,
    is_aggregate: bool,
    dependencies: IndexSet<String>,
    explicit_dependencies: Option<Vec<String>>,
    metadata: BTreeMap<String, Value>,
}

impl SqlFragment {
    /// Create a fragment reading `expression` from `source_table`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFragment`] if either string is empty.
    pub fn new(expression: impl Into<String>, source_table: impl Into<String>) -> Result<Self> {
        let expression = expression.into();
        let source_table = source_table.into();

        if expression.trim().is_empty() {
            return Err(Error::InvalidFragment(
                "expression must be a non-empty string".to_string(),
            ));
        }
        if source_table.trim().is_empty() {
            return Err(Error::InvalidFragment(
                "source_table must be a non-empty string".to_string(),
            ));
        }

        Ok(Self {
            expression,
            source_table,
            requires_unnest: false,
            is_aggregate: false,
            dependencies: IndexSet::new(),
            explicit_dependencies: None,
            metadata: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn with_unnest(mut self, array_column: impl Into<String>) -> Self {
        self.requires_unnest = true;
        self.metadata
            .insert(ARRAY_COLUMN.to_string(), Value::String(array_column.into()));
        self
    }

    /// Mark the fragment as unnesting without supplying the array expression.
    #[must_use]
    pub fn with_requires_unnest(mut self, requires_unnest: bool) -> Self {
        self.requires_unnest = requires_unnest;
        self
    }

    #[must_use]
    pub fn with_aggregate(mut self, is_aggregate: bool) -> Self {
        self.is_aggregate = is_aggregate;
        self
    }

    /// Add a CTE or external table this fragment reads from.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    /// Override the dependency list used for the CTE.
    #[must_use]
    pub fn with_explicit_dependencies(mut self, names: Vec<String>) -> Self {
        self.explicit_dependencies = Some(names);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn source_table(&self) -> &str {
        &self.source_table
    }

    pub fn requires_unnest(&self) -> bool {
        self.requires_unnest
    }

    pub fn is_aggregate(&self) -> bool {
        self.is_aggregate
    }

    pub fn dependencies(&self) -> &IndexSet<String> {
        &self.dependencies
    }

    /// Explicit dependencies when supplied, otherwise the recorded ones.
    pub fn effective_dependencies(&self) -> Vec<String> {
        match &self.explicit_dependencies {
            Some(names) => names.clone(),
            None => self.dependencies.iter().cloned().collect(),
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// A string metadata value.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// A boolean metadata value, `false` when absent.
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_expression_is_rejected() {
        let err = SqlFragment::new("  ", "resource").unwrap_err();
        assert!(matches!(err, Error::InvalidFragment(_)));

        let err = SqlFragment::new("resource", "").unwrap_err();
        assert!(err.to_string().contains("source_table"));
    }

    #[test]
    fn test_explicit_dependencies_take_precedence() {
        let fragment = SqlFragment::new("result", "cte_2")
            .unwrap()
            .with_dependency("cte_2");
        assert_eq!(fragment.effective_dependencies(), vec!["cte_2"]);

        let fragment = fragment.with_explicit_dependencies(vec!["cte_1".into(), "cte_2".into()]);
        assert_eq!(fragment.effective_dependencies(), vec!["cte_1", "cte_2"]);
    }

    #[test]
    fn test_dependencies_keep_insertion_order() {
        let fragment = SqlFragment::new("x", "cte_3")
            .unwrap()
            .with_dependency("cte_3")
            .with_dependency("cte_1")
            .with_dependency("cte_3");
        let deps: Vec<_> = fragment.dependencies().iter().cloned().collect();
        assert_eq!(deps, vec!["cte_3", "cte_1"]);
    }

    #[test]
    fn test_unnest_records_array_column() {
        let fragment = SqlFragment::new("elem.value", "resource")
            .unwrap()
            .with_unnest("resource->'name'");
        assert!(fragment.requires_unnest());
        assert_eq!(fragment.metadata_str(ARRAY_COLUMN), Some("resource->'name'"));
        assert!(!fragment.metadata_flag(SOURCE_ELEMENT_ROWS));
    }
}
