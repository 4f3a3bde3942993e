//! Mutable state threaded through a single translation pass.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::ast::{LiteralType, SqlDataType};

/// Type of a translated SQL value, used for coercion decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// A JSON value (object, array or scalar) that still needs extraction.
    Json,
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Null,
}

impl ValueType {
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::DateTime | Self::Time)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "dateTime",
            Self::Time => "time",
            Self::Null => "null",
        }
    }
}

impl From<LiteralType> for ValueType {
    fn from(literal_type: LiteralType) -> Self {
        match literal_type {
            LiteralType::String => Self::String,
            LiteralType::Integer => Self::Integer,
            LiteralType::Decimal => Self::Decimal,
            LiteralType::Boolean => Self::Boolean,
            LiteralType::Date => Self::Date,
            LiteralType::DateTime => Self::DateTime,
            LiteralType::Time => Self::Time,
            LiteralType::Quantity => Self::Json,
            LiteralType::Null => Self::Null,
        }
    }
}

impl From<SqlDataType> for ValueType {
    fn from(sql_type: SqlDataType) -> Self {
        match sql_type {
            SqlDataType::Text => Self::String,
            SqlDataType::Integer => Self::Integer,
            SqlDataType::Decimal => Self::Decimal,
            SqlDataType::Boolean => Self::Boolean,
            SqlDataType::Date => Self::Date,
            SqlDataType::Timestamp => Self::DateTime,
            SqlDataType::Time => Self::Time,
            SqlDataType::Json => Self::Json,
        }
    }
}

/// A variable visible to the expression being translated.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableBinding {
    /// SQL expression the variable stands for.
    pub expression: String,

    /// Type of the bound expression.
    pub value_type: ValueType,

    pub metadata: BTreeMap<String, Value>,
}

impl VariableBinding {
    pub fn new(expression: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            expression: expression.into(),
            value_type,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Saved navigation state, restored when a nested construct finishes.
#[derive(Debug, Clone)]
pub(crate) struct ContextSnapshot {
    current_table: String,
    document_table: String,
    base_column: String,
    base_is_item: bool,
    base_type: ValueType,
    parent_path: Vec<String>,
    element_rows: bool,
    inline_depth: usize,
    scope_depth: usize,
}

/// Navigation state and lexical scopes for one `translate()` call.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    /// Table or CTE the current expression reads from.
    pub current_table: String,

    /// Latest table with exactly one row per document.
    pub document_table: String,

    /// SQL expression the path components are relative to.
    pub base_column: String,

    pub base_type: ValueType,

    /// `base_column` holds a single JSON item rather than a collection.
    pub base_is_item: bool,

    /// JSON navigation path below `base_column`.
    pub parent_path: Vec<String>,

    /// The current source has one row per collection element.
    pub element_rows: bool,

    /// Nesting level of operands and arguments; above zero nothing is materialized.
    pub inline_depth: usize,

    root_table: String,
    root_column: String,
    variable_bindings: Vec<HashMap<String, VariableBinding>>,
    alias_counter: usize,
}

impl TranslationContext {
    /// Create a context rooted at `root_table.root_column`.
    pub fn new(root_table: impl Into<String>, root_column: impl Into<String>) -> Self {
        let root_table = root_table.into();
        let root_column = root_column.into();
        Self {
            current_table: root_table.clone(),
            document_table: root_table.clone(),
            base_column: root_column.clone(),
            base_type: ValueType::Json,
            base_is_item: true,
            parent_path: Vec::new(),
            element_rows: false,
            inline_depth: 0,
            root_table,
            root_column,
            // The outermost scope holds constants and defineVariable() results.
            variable_bindings: vec![HashMap::new()],
            alias_counter: 0,
        }
    }

    pub fn root_table(&self) -> &str {
        &self.root_table
    }

    pub fn root_column(&self) -> &str {
        &self.root_column
    }

    /// Whether the context is still positioned on the root document.
    pub fn at_root(&self) -> bool {
        self.current_table == self.root_table
            && self.base_column == self.root_column
            && self.parent_path.is_empty()
    }

    pub fn extend_path(&mut self, component: impl Into<String>) {
        self.parent_path.push(component.into());
    }

    pub fn reset_path(&mut self) {
        self.parent_path.clear();
    }

    /// Replace the last path component, returning the old one.
    pub fn replace_last_path_component(&mut self, component: impl Into<String>) -> Option<String> {
        let last = self.parent_path.pop();
        self.parent_path.push(component.into());
        last
    }

    /// Make `base` the new navigation root with an empty path.
    pub fn rebase(&mut self, base: impl Into<String>, base_type: ValueType) {
        self.base_column = base.into();
        self.base_type = base_type;
        self.base_is_item = false;
        self.parent_path.clear();
    }

    /// Rebase on a single JSON item, such as a document or a lambda element.
    pub fn rebase_item(&mut self, base: impl Into<String>) {
        self.rebase(base, ValueType::Json);
        self.base_is_item = true;
    }

    /// Move to a newly materialized table.
    pub fn move_to(
        &mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        element_rows: bool,
        base_type: ValueType,
    ) {
        self.current_table = table.into();
        if !element_rows {
            self.document_table = self.current_table.clone();
        }
        self.rebase(column, base_type);
        self.base_is_item = element_rows;
        self.element_rows = element_rows;
    }

    pub fn push_scope(&mut self) {
        self.variable_bindings.push(HashMap::new());
    }

    /// Pop the innermost scope. The outermost scope is never popped.
    pub fn pop_scope(&mut self) -> Option<HashMap<String, VariableBinding>> {
        if self.variable_bindings.len() > 1 {
            self.variable_bindings.pop()
        } else {
            None
        }
    }

    pub fn scope_depth(&self) -> usize {
        self.variable_bindings.len()
    }

    /// Bind `name` in the innermost scope, shadowing outer bindings.
    pub fn bind_variable(&mut self, name: impl Into<String>, binding: VariableBinding) {
        if let Some(scope) = self.variable_bindings.last_mut() {
            scope.insert(name.into(), binding);
        }
    }

    /// Bind `name` in the outermost scope.
    pub fn bind_global(&mut self, name: impl Into<String>, binding: VariableBinding) {
        if let Some(scope) = self.variable_bindings.first_mut() {
            scope.insert(name.into(), binding);
        }
    }

    /// Look `name` up from the innermost scope outwards.
    pub fn resolve_variable(&self, name: &str) -> Option<&VariableBinding> {
        self.variable_bindings
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
    }

    /// All visible bindings with shadowing applied, sorted by name.
    pub fn visible_bindings(&self) -> BTreeMap<String, VariableBinding> {
        let mut visible = BTreeMap::new();
        for scope in &self.variable_bindings {
            for (name, binding) in scope {
                visible.insert(name.clone(), binding.clone());
            }
        }
        visible
    }

    /// Next unique alias with the given prefix (`e1`, `e2`, ...).
    pub fn next_alias(&mut self, prefix: &str) -> String {
        self.alias_counter += 1;
        format!("{prefix}{}", self.alias_counter)
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            current_table: self.current_table.clone(),
            document_table: self.document_table.clone(),
            base_column: self.base_column.clone(),
            base_is_item: self.base_is_item,
            base_type: self.base_type,
            parent_path: self.parent_path.clone(),
            element_rows: self.element_rows,
            inline_depth: self.inline_depth,
            scope_depth: self.variable_bindings.len(),
        }
    }

    /// Restore navigation state and drop every scope pushed since `snapshot`.
    pub(crate) fn restore(&mut self, snapshot: ContextSnapshot) {
        self.current_table = snapshot.current_table;
        self.document_table = snapshot.document_table;
        self.base_column = snapshot.base_column;
        self.base_is_item = snapshot.base_is_item;
        self.base_type = snapshot.base_type;
        self.parent_path = snapshot.parent_path;
        self.element_rows = snapshot.element_rows;
        self.inline_depth = snapshot.inline_depth;
        self.variable_bindings.truncate(snapshot.scope_depth.max(1));
    }
}
