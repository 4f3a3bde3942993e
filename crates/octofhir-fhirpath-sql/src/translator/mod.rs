//! AST to SQL fragment translation.
//!
//! The direct children of the root path expression form the *spine* of the
//! query. Function calls and type operations on the spine are materialized
//! as [`SqlFragment`]s, each of which becomes one CTE. Everything else
//! (navigation steps, literals, operators and the arguments of functions) is
//! translated inline into scalar SQL or correlated subqueries and folded
//! into the expression of the enclosing fragment.

mod functions;
mod operators;
mod temporal;
mod types;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::ast::{AstNode, LiteralType, NodeKind, SqlDataType, TypeOperationKind};
use crate::config::CompilerConfig;
use crate::context::{ContextSnapshot, TranslationContext, ValueType, VariableBinding};
use crate::cte::cte_name;
use crate::dialect::{SqlDialect, quote_literal};
use crate::fragment::{
    self, ELEMENT_ALIAS, ITEM_INDEX_COLUMN, RESULT_COLUMN, SOURCE_ALIAS, SqlFragment,
};
use crate::{Error, Result};

use functions::FhirFunction;
use temporal::TemporalLiteral;
use types::TypeTarget;

/// Binding metadata key naming the table a variable was defined against.
const BINDING_SOURCE_TABLE: &str = "source_table";

/// `path` followed from a JSON `base`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Navigation {
    pub base: String,
    pub path: Vec<String>,
    /// `base` is a single JSON item rather than a collection.
    pub base_is_item: bool,
}

impl Navigation {
    pub fn new(base: impl Into<String>, path: Vec<String>, base_is_item: bool) -> Self {
        Self {
            base: base.into(),
            path,
            base_is_item,
        }
    }

    /// The same navigation one step further.
    pub fn child(&self, field: &str) -> Self {
        let mut path = self.path.clone();
        path.push(field.to_string());
        Self::new(self.base.clone(), path, self.base_is_item)
    }

    /// Plain member access reaches the value without crossing a collection.
    fn is_direct(&self) -> bool {
        self.path.is_empty() || (self.base_is_item && self.path.len() == 1)
    }

    fn json(&self, dialect: &dyn SqlDialect) -> String {
        if self.is_direct() {
            dialect.extract_json_object(&self.base, &self.path)
        } else {
            dialect.flatten_json_path(&self.base, &self.path, self.base_is_item)
        }
    }

    fn text(&self, dialect: &dyn SqlDialect) -> String {
        if self.is_direct() {
            dialect.extract_json_text(&self.base, &self.path)
        } else {
            dialect.json_to_text(&self.json(dialect))
        }
    }
}

/// A translated SQL value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expr {
    pub sql: String,
    pub ty: ValueType,
    /// JSON navigation the SQL was rendered from.
    pub navigation: Option<Navigation>,
    /// Source value and type of a literal.
    pub literal: Option<(String, LiteralType)>,
}

impl Expr {
    pub fn new(sql: impl Into<String>, ty: ValueType) -> Self {
        Self {
            sql: sql.into(),
            ty,
            navigation: None,
            literal: None,
        }
    }

    pub fn navigation(dialect: &dyn SqlDialect, navigation: Navigation) -> Self {
        Self {
            sql: navigation.json(dialect),
            ty: ValueType::Json,
            navigation: Some(navigation),
            literal: None,
        }
    }

    fn literal(sql: String, literal_type: LiteralType, value: &str) -> Self {
        Self {
            sql,
            ty: literal_type.into(),
            navigation: None,
            literal: Some((value.to_string(), literal_type)),
        }
    }

    /// The value as SQL text.
    pub fn text(&self, dialect: &dyn SqlDialect) -> String {
        match self.ty {
            ValueType::Json => match &self.navigation {
                Some(navigation) if !navigation.path.is_empty() => navigation.text(dialect),
                _ => dialect.json_to_text(&self.sql),
            },
            ValueType::String => self.sql.clone(),
            ValueType::Null => dialect.typed_null(SqlDataType::Text),
            _ => dialect.cast(&self.sql, SqlDataType::Text),
        }
    }

    /// The value as a JSON value.
    pub fn json(&self, dialect: &dyn SqlDialect) -> String {
        match self.ty {
            ValueType::Json => self.sql.clone(),
            ValueType::Null => "NULL".to_string(),
            _ => dialect.to_json(&self.sql),
        }
    }

    /// The value as a number, with its resulting type.
    pub fn numeric(&self, dialect: &dyn SqlDialect) -> (String, ValueType) {
        match self.ty {
            ValueType::Integer | ValueType::Decimal => (self.sql.clone(), self.ty),
            ValueType::Null => (dialect.typed_null(SqlDataType::Decimal), ValueType::Decimal),
            _ => (
                dialect.safe_cast(&self.text(dialect), SqlDataType::Decimal),
                ValueType::Decimal,
            ),
        }
    }

    /// The value as a boolean.
    pub fn boolean(&self, dialect: &dyn SqlDialect) -> String {
        match self.ty {
            ValueType::Boolean => self.sql.clone(),
            ValueType::Null => dialect.typed_null(SqlDataType::Boolean),
            ValueType::Integer | ValueType::Decimal => format!("({} <> 0)", self.sql),
            _ => dialect.safe_cast(&self.text(dialect), SqlDataType::Boolean),
        }
    }

    /// The value converted to `target`, reading JSON through safe casts.
    pub fn typed(&self, dialect: &dyn SqlDialect, target: SqlDataType) -> String {
        if ValueType::from(target) == self.ty {
            return self.sql.clone();
        }
        match target {
            SqlDataType::Text => self.text(dialect),
            SqlDataType::Json => self.json(dialect),
            SqlDataType::Boolean => self.boolean(dialect),
            SqlDataType::Decimal if self.ty == ValueType::Integer => self.sql.clone(),
            _ if self.ty == ValueType::Null => dialect.typed_null(target),
            _ => dialect.safe_cast(&self.text(dialect), target),
        }
    }

    /// Convert to `target` and carry the new type.
    pub fn coerce(&self, dialect: &dyn SqlDialect, target: SqlDataType) -> Expr {
        Expr::new(self.typed(dialect, target), target.into())
    }

    pub fn literal_type(&self) -> Option<LiteralType> {
        self.literal.as_ref().map(|(_, literal_type)| *literal_type)
    }

    /// A numeric literal equal to zero.
    pub fn is_zero_literal(&self) -> bool {
        match &self.literal {
            Some((value, LiteralType::Integer | LiteralType::Decimal)) => {
                value.parse::<f64>().is_ok_and(|v| v == 0.0)
            }
            _ => false,
        }
    }

    /// Integer value of an integer literal.
    pub fn integer_literal(&self) -> Option<i64> {
        match &self.literal {
            Some((value, LiteralType::Integer)) => value.parse().ok(),
            _ => None,
        }
    }

    /// Parsed temporal literal, if this is one.
    fn temporal_literal(&self) -> Option<Result<TemporalLiteral>> {
        match &self.literal {
            Some((value, literal_type)) if literal_type.is_temporal() => {
                Some(TemporalLiteral::parse(value, *literal_type))
            }
            _ => None,
        }
    }
}

/// Wrap `sql` in parentheses unless it is a column reference or already grouped.
pub(crate) fn grouped(sql: &str) -> String {
    let simple = sql
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if simple || is_parenthesized(sql) {
        sql.to_string()
    } else {
        format!("({sql})")
    }
}

fn is_parenthesized(sql: &str) -> bool {
    if !sql.starts_with('(') || !sql.ends_with(')') {
        return false;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    for (position, c) in sql.char_indices() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 && position + 1 < sql.len() {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Translates an AST into an ordered list of SQL fragments.
///
/// One instance performs one translation at a time; use separate instances
/// for concurrent compilations.
pub struct Translator {
    dialect: Arc<dyn SqlDialect>,
    root_table: String,
    resource_column: String,
    resource_type: Option<String>,
    constants: Vec<(String, VariableBinding)>,
    context: TranslationContext,
    fragments: Vec<SqlFragment>,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("dialect", &self.dialect.name())
            .field("root_table", &self.root_table)
            .field("resource_type", &self.resource_type)
            .field("fragments", &self.fragments.len())
            .finish()
    }
}

impl Translator {
    /// Create a translator reading `resource.resource`.
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        let config = CompilerConfig::default();
        Self::with_dialect(&config, dialect)
    }

    /// Create a translator for the configured root table and dialect.
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self::with_dialect(config, config.dialect())
    }

    /// Create a translator for the configured root table and a custom dialect.
    pub fn with_dialect(config: &CompilerConfig, dialect: Arc<dyn SqlDialect>) -> Self {
        let root_table = config.resource_table.clone();
        let resource_column = config.resource_column.clone();
        let context = TranslationContext::new(
            root_table.clone(),
            format!("{SOURCE_ALIAS}.{resource_column}"),
        );
        Self {
            dialect,
            root_table,
            resource_column,
            resource_type: config.resource_type.clone(),
            constants: Vec::new(),
            context,
            fragments: Vec::new(),
        }
    }

    /// Register a `%name` constant visible to every expression.
    #[must_use]
    pub fn with_constant(mut self, name: impl Into<String>, binding: VariableBinding) -> Self {
        let name = name.into();
        let name = if name.starts_with('%') {
            name
        } else {
            format!("%{name}")
        };
        self.context.bind_global(name.clone(), binding.clone());
        self.constants.push((name, binding));
        self
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    pub fn context(&self) -> &TranslationContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TranslationContext {
        &mut self.context
    }

    /// Push a variable scope holding `bindings`.
    ///
    /// The returned guard dereferences to the translator. Dropping it restores
    /// the navigation state and the scopes that were active on entry, whether
    /// the nested translation succeeded or not.
    pub fn enter_scope<I, N>(&mut self, bindings: I) -> ScopedTranslator<'_>
    where
        I: IntoIterator<Item = (N, VariableBinding)>,
        N: Into<String>,
    {
        let snapshot = self.context.snapshot();
        self.context.push_scope();
        for (name, binding) in bindings {
            self.context.bind_variable(name, binding);
        }
        ScopedTranslator {
            translator: self,
            snapshot: Some(snapshot),
        }
    }

    /// An isolated navigation frame without new bindings.
    fn frame(&mut self) -> ScopedTranslator<'_> {
        self.enter_scope(std::iter::empty::<(String, VariableBinding)>())
    }

    /// Translate `root` into fragments in dependency order.
    ///
    /// # Errors
    ///
    /// Returns a translation error if the tree contains an unknown operator
    /// or function, a wrong argument count, an unbound variable or an
    /// unsupported literal. Nothing is returned from a failed translation.
    pub fn translate(&mut self, root: &AstNode) -> Result<Vec<SqlFragment>> {
        self.reset();
        debug!(expression = %root, dialect = self.dialect.name(), "Translating expression");

        let steps = match root.kind {
            NodeKind::PathExpression => root.children.as_slice(),
            _ => std::slice::from_ref(root),
        };
        let outcome = self
            .translate_spine(steps)
            .and_then(|pending| self.finish(pending));
        let fragments = std::mem::take(&mut self.fragments);
        outcome?;

        if fragments.is_empty() {
            return Err(Error::EmptyTranslation);
        }
        debug!(fragments = fragments.len(), "Translation complete");
        Ok(fragments)
    }

    fn reset(&mut self) {
        self.context = TranslationContext::new(
            self.root_table.clone(),
            format!("{SOURCE_ALIAS}.{}", self.resource_column),
        );
        for (name, binding) in &self.constants {
            self.context.bind_global(name.clone(), binding.clone());
        }
        self.fragments.clear();
    }

    // ------------------------------------------------------------------
    // Spine
    // ------------------------------------------------------------------

    /// Walk the spine, returning the trailing inline expression if the last
    /// step was one.
    fn translate_spine(&mut self, steps: &[AstNode]) -> Result<Option<Expr>> {
        let mut pending = None;
        for (position, step) in steps.iter().enumerate() {
            pending = None;
            match &step.kind {
                NodeKind::Identifier { name } => {
                    if position == 0 && self.is_root_type(name) {
                        trace!(resource_type = %name, "Skipping root type");
                        continue;
                    }
                    self.navigate(name)?;
                }
                NodeKind::FunctionCall { name } => self.spine_function(name, step)?,
                NodeKind::TypeOperation { kind, target_type } if step.children.is_empty() => {
                    self.spine_type_operation(*kind, target_type)?;
                }
                NodeKind::PathExpression if position == 0 => {
                    pending = self.translate_spine(&step.children)?;
                }
                _ => {
                    let expr = self.inline(step)?;
                    self.focus_on(&expr);
                    pending = Some(expr);
                }
            }
        }
        Ok(pending)
    }

    fn spine_function(&mut self, name: &str, node: &AstNode) -> Result<()> {
        let function = FhirFunction::lookup(name, node.arguments().len())?;
        match function {
            FhirFunction::Where | FhirFunction::Select => self.spine_unnest(function, node),
            FhirFunction::DefineVariable => {
                let input = self.focus()?;
                self.define_variable(&input, node)?;
                Ok(())
            }
            FhirFunction::OfType | FhirFunction::As | FhirFunction::Is => {
                let target = functions::type_argument(node)?;
                let kind = match function {
                    FhirFunction::Is => TypeOperationKind::Is,
                    FhirFunction::As => TypeOperationKind::As,
                    _ => TypeOperationKind::OfType,
                };
                self.spine_type_operation(kind, &target)
            }
            _ if function.is_aggregate() && self.context.element_rows => {
                self.spine_aggregate(function)
            }
            _ => {
                self.collapse_element_rows()?;
                let input = self.focus()?;
                let result = self.apply_function(function, &input, node)?;
                let fragment = self
                    .fragment(result.sql.clone())?
                    .with_metadata(fragment::FUNCTION, function.name());
                self.emit(fragment, false, result.ty)
            }
        }
    }

    /// `where`/`select` on the spine: one row per matching element.
    fn spine_unnest(&mut self, function: FhirFunction, node: &AstNode) -> Result<()> {
        let input = self.focus()?;
        let collection = input.json(self.dialect());
        let element = format!("{ELEMENT_ALIAS}.value");
        let index = format!("({ELEMENT_ALIAS}.ordinality - 1)");
        let body = self.lambda(&collection, &element, &index, &node.children[0])?;

        if function == FhirFunction::Where {
            let condition = body.boolean(self.dialect());
            let fragment = self
                .fragment(element)?
                .with_unnest(collection)
                .with_metadata(fragment::FILTER_CONDITION, condition)
                .with_metadata(fragment::FUNCTION, function.name());
            return self.emit(fragment, true, ValueType::Json);
        }

        let fragment = self
            .fragment(body.sql.clone())?
            .with_unnest(collection)
            .with_metadata(fragment::FUNCTION, function.name());
        self.emit(fragment, true, body.ty)?;

        if body.ty == ValueType::Json {
            // Projections yield collections; flatten them into element rows.
            let nested = self.focus()?;
            let fragment = self
                .fragment(format!("{ELEMENT_ALIAS}.value"))?
                .with_unnest(nested.json(self.dialect()))
                .with_metadata(fragment::FUNCTION, "flatten");
            self.emit(fragment, true, ValueType::Json)?;
        }
        Ok(())
    }

    /// An aggregate over element rows, grouped back to one row per document.
    fn spine_aggregate(&mut self, function: FhirFunction) -> Result<()> {
        let input = self.focus()?;
        let element = Expr::new(format!("{ELEMENT_ALIAS}.value"), ValueType::Json);
        let (expression, ty) = self.aggregate_sql(function, &element);
        let fragment = self
            .regrouped(expression)?
            .with_unnest(input.json(self.dialect()))
            .with_metadata(fragment::FUNCTION, function.name());
        self.emit(fragment, false, ty)
    }

    fn spine_type_operation(&mut self, kind: TypeOperationKind, target: &str) -> Result<()> {
        let input = self.focus()?;
        let (result, discriminator) = self.resolve_type(&input, kind, target)?;
        let mut fragment = self
            .fragment(result.sql.clone())?
            .with_metadata(fragment::FUNCTION, kind.as_str());
        if let Some(field) = discriminator {
            fragment = fragment.with_metadata(fragment::DISCRIMINATOR_FIELDS, vec![field]);
        }
        let element_rows = self.context.element_rows;
        self.emit(fragment, element_rows, result.ty)
    }

    /// Collect element rows back into one JSON array per document.
    fn collapse_element_rows(&mut self) -> Result<()> {
        if !self.context.element_rows {
            return Ok(());
        }
        let input = self.focus()?;
        // Documents without elements aggregate to NULL, the empty collection.
        let expression = format!(
            "{} FILTER (WHERE {ELEMENT_ALIAS}.value IS NOT NULL)",
            self.dialect.aggregate_json_array(
                &format!("{ELEMENT_ALIAS}.value"),
                &format!("{SOURCE_ALIAS}.{ITEM_INDEX_COLUMN}, {ELEMENT_ALIAS}.ordinality"),
            )
        );
        let fragment = self
            .regrouped(expression)?
            .with_unnest(input.json(self.dialect()))
            .with_metadata(fragment::FUNCTION, "collect");
        self.emit(fragment, false, ValueType::Json)
    }

    /// An aggregate over the current element rows with one output row for
    /// every document of the last document-level table.
    fn regrouped(&self, expression: impl Into<String>) -> Result<SqlFragment> {
        let document = self.context.document_table.clone();
        let mut fragment = self.fragment(expression)?.with_aggregate(true);
        if document != self.root_table {
            fragment = fragment.with_dependency(document.clone());
        }
        Ok(fragment.with_metadata(fragment::DOCUMENT_TABLE, document))
    }

    /// Emit whatever the spine left unmaterialized.
    fn finish(&mut self, pending: Option<Expr>) -> Result<()> {
        if self.context.element_rows {
            return self.collapse_element_rows();
        }
        if self.is_materialized() {
            return Ok(());
        }

        let result = match pending {
            Some(expr) => expr,
            None => self.focus()?,
        };
        let mut fragment = self.fragment(result.sql.clone())?;
        if let Some(literal_type) = result.literal_type() {
            fragment = fragment.with_metadata(fragment::LITERAL_TYPE, literal_type.as_str());
        }
        self.emit(fragment, false, result.ty)
    }

    fn is_materialized(&self) -> bool {
        !self.fragments.is_empty()
            && self.context.current_table == cte_name(self.fragments.len())
            && self.context.parent_path.is_empty()
            && self.context.base_column == result_column()
    }

    /// A fragment reading from the current table.
    fn fragment(&self, expression: impl Into<String>) -> Result<SqlFragment> {
        let table = &self.context.current_table;
        let mut fragment = SqlFragment::new(expression, table.clone())?;
        if *table != self.root_table {
            fragment = fragment.with_dependency(table.clone());
        }
        if self.context.element_rows {
            fragment = fragment.with_metadata(fragment::SOURCE_ELEMENT_ROWS, true);
        }
        Ok(fragment)
    }

    /// Append `fragment` and continue from the CTE it becomes.
    fn emit(&mut self, fragment: SqlFragment, element_rows: bool, ty: ValueType) -> Result<()> {
        let mut fragment = fragment
            .with_metadata(fragment::RESULT_ALIAS, RESULT_COLUMN)
            .with_metadata(fragment::RESULT_TYPE, ty.as_str());
        if ty == ValueType::String {
            fragment = fragment.with_metadata(fragment::IS_JSON_STRING, true);
        }
        self.fragments.push(fragment);

        let name = cte_name(self.fragments.len());
        trace!(cte = %name, element_rows, "Materialized fragment");
        self.context.move_to(name, result_column(), element_rows, ty);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inline translation
    // ------------------------------------------------------------------

    /// Translate `node` into a single SQL value relative to the current focus.
    pub(crate) fn inline(&mut self, node: &AstNode) -> Result<Expr> {
        match &node.kind {
            NodeKind::Literal {
                value,
                literal_type,
            } => self.literal(value, *literal_type),
            NodeKind::Identifier { .. } => self.inline_path(std::slice::from_ref(node)),
            NodeKind::PathExpression => self.inline_path(&node.children),
            NodeKind::Operator { symbol, arity } => self.operator(node, symbol, *arity),
            NodeKind::FunctionCall { name } => {
                let input = self.focus()?;
                self.call(name, &input, node)
            }
            NodeKind::TypeOperation { kind, target_type } => {
                let input = match node.children.first() {
                    Some(operand) => self.operand(operand)?,
                    None => self.focus()?,
                };
                Ok(self.resolve_type(&input, *kind, target_type)?.0)
            }
        }
    }

    fn inline_path(&mut self, steps: &[AstNode]) -> Result<Expr> {
        let mut frame = self.frame();
        for (position, step) in steps.iter().enumerate() {
            match &step.kind {
                NodeKind::Identifier { name } => {
                    if position == 0 && is_type_name(name) {
                        let root = frame.root_document();
                        frame.context.rebase_item(root);
                        continue;
                    }
                    frame.navigate(name)?;
                }
                NodeKind::FunctionCall { name } => {
                    let input = frame.focus()?;
                    let output = frame.call(name, &input, step)?;
                    frame.focus_on(&output);
                }
                NodeKind::TypeOperation { kind, target_type } if step.children.is_empty() => {
                    let input = frame.focus()?;
                    let (output, _) = frame.resolve_type(&input, *kind, target_type)?;
                    frame.focus_on(&output);
                }
                NodeKind::PathExpression if position == 0 => {
                    let output = frame.inline_path(&step.children)?;
                    frame.focus_on(&output);
                }
                _ => {
                    let output = frame.inline(step)?;
                    frame.focus_on(&output);
                }
            }
        }
        let result = frame.focus()?;
        Ok(result)
    }

    /// Translate an operator operand in an isolated frame.
    pub(crate) fn operand(&mut self, node: &AstNode) -> Result<Expr> {
        let mut frame = self.frame();
        frame.context.inline_depth += 1;
        let expr = frame.inline(node)?;
        let expr = match node.sql_data_type() {
            Some(target) if expr.ty == ValueType::Json && target != SqlDataType::Json => {
                expr.coerce(frame.dialect(), target)
            }
            _ => expr,
        };
        Ok(expr)
    }

    /// Translate a function argument with `input` as its focus.
    pub(crate) fn argument(&mut self, input: &Expr, node: &AstNode) -> Result<Expr> {
        let mut frame = self.frame();
        frame.context.inline_depth += 1;
        frame.focus_on(input);
        let expr = frame.inline(node)?;
        Ok(expr)
    }

    /// Translate `body` once per element of `collection`.
    ///
    /// `$this`, `$index` and `$total` are bound for the duration of the body.
    pub(crate) fn lambda(
        &mut self,
        collection: &str,
        element: &str,
        index: &str,
        body: &AstNode,
    ) -> Result<Expr> {
        let total = self.dialect.array_length(collection);
        let mut scope = self.enter_scope([
            ("$this", VariableBinding::new(element, ValueType::Json)),
            ("$index", VariableBinding::new(index, ValueType::Integer)),
            ("$total", VariableBinding::new(total, ValueType::Integer)),
        ]);
        scope.context.rebase_item(element);
        scope.context.inline_depth += 1;
        let expr = scope.inline(body)?;
        Ok(expr)
    }

    fn literal(&self, value: &str, literal_type: LiteralType) -> Result<Expr> {
        let dialect = self.dialect();
        let invalid = || Error::InvalidLiteral(format!("{literal_type} literal '{value}'"));
        let sql = match literal_type {
            LiteralType::String => dialect.string_literal(value),
            LiteralType::Integer => {
                value.parse::<i64>().map_err(|_| invalid())?;
                value.to_string()
            }
            LiteralType::Decimal => {
                value.parse::<f64>().map_err(|_| invalid())?;
                value.to_string()
            }
            LiteralType::Boolean => match value {
                "true" => dialect.boolean_literal(true),
                "false" => dialect.boolean_literal(false),
                _ => return Err(invalid()),
            },
            LiteralType::Date | LiteralType::DateTime | LiteralType::Time => {
                let temporal = TemporalLiteral::parse(value, literal_type)?;
                if !temporal.is_full_precision() {
                    // Partial values keep their source form; comparisons use their bounds.
                    dialect.string_literal(value)
                } else {
                    match literal_type {
                        LiteralType::Date => dialect.date_literal(value),
                        LiteralType::DateTime => dialect.datetime_literal(value),
                        _ => dialect.time_literal(value),
                    }
                }
            }
            LiteralType::Null => "NULL".to_string(),
            LiteralType::Quantity => {
                return Err(Error::UnsupportedLiteralType(
                    literal_type.as_str().to_string(),
                ));
            }
        };
        Ok(Expr::literal(sql, literal_type, value))
    }

    // ------------------------------------------------------------------
    // Navigation and variables
    // ------------------------------------------------------------------

    /// The expression the context currently points at.
    pub(crate) fn focus(&self) -> Result<Expr> {
        let context = &self.context;
        if context.parent_path.is_empty() {
            let mut expr = Expr::new(context.base_column.clone(), context.base_type);
            if context.base_type == ValueType::Json {
                expr.navigation = Some(Navigation::new(
                    grouped(&context.base_column),
                    Vec::new(),
                    context.base_is_item,
                ));
            }
            return Ok(expr);
        }
        if context.base_type != ValueType::Json {
            return Err(Error::InvalidPath(format!(
                "cannot navigate to '{}' on a {} value",
                context.parent_path.join("."),
                context.base_type.as_str()
            )));
        }
        Ok(Expr::navigation(
            self.dialect(),
            Navigation::new(
                grouped(&context.base_column),
                context.parent_path.clone(),
                context.base_is_item,
            ),
        ))
    }

    /// Make `expr` the new focus.
    pub(crate) fn focus_on(&mut self, expr: &Expr) {
        match &expr.navigation {
            Some(navigation) => {
                self.context.rebase(navigation.base.clone(), ValueType::Json);
                self.context.base_is_item = navigation.base_is_item;
                self.context.parent_path = navigation.path.clone();
            }
            None => self.context.rebase(expr.sql.clone(), expr.ty),
        }
    }

    fn navigate(&mut self, name: &str) -> Result<()> {
        match self.variable(name)? {
            Some(binding) if binding_is_item(name) => {
                self.context.rebase_item(binding.expression);
            }
            Some(binding) => {
                self.context
                    .rebase(binding.expression, binding.value_type);
            }
            None => self.context.extend_path(name.trim_matches('`')),
        }
        Ok(())
    }

    /// Resolve `$name` and `%name` references; plain identifiers yield `None`.
    fn variable(&self, name: &str) -> Result<Option<VariableBinding>> {
        if !name.starts_with('$') && !name.starts_with('%') {
            return Ok(None);
        }
        let builtin = match name {
            "%resource" | "%context" | "%rootResource" => {
                Some(VariableBinding::new(self.root_document(), ValueType::Json))
            }
            "%ucum" => Some(VariableBinding::new(
                quote_literal("http://unitsofmeasure.org"),
                ValueType::String,
            )),
            "%sct" => Some(VariableBinding::new(
                quote_literal("http://snomed.info/sct"),
                ValueType::String,
            )),
            "%loinc" => Some(VariableBinding::new(
                quote_literal("http://loinc.org"),
                ValueType::String,
            )),
            _ => None,
        };
        if builtin.is_some() {
            return Ok(builtin);
        }

        let binding = self
            .context
            .resolve_variable(name)
            .ok_or_else(|| Error::UnboundVariable(name.to_string()))?;
        if let Some(Value::String(table)) = binding.metadata.get(BINDING_SOURCE_TABLE) {
            if *table != self.context.current_table {
                return Err(Error::InvalidPath(format!(
                    "variable {name} was defined on {table} and is not visible from {}",
                    self.context.current_table
                )));
            }
        }
        Ok(Some(binding.clone()))
    }

    /// `defineVariable(name [, value])`: bind in the innermost scope, return the input.
    fn define_variable(&mut self, input: &Expr, node: &AstNode) -> Result<Expr> {
        let name = functions::string_argument(node, 0)?;
        let value = match node.children.get(1) {
            Some(expression) => self.argument(input, expression)?,
            None => input.clone(),
        };
        let binding = VariableBinding::new(value.sql.clone(), value.ty).with_metadata(
            BINDING_SOURCE_TABLE,
            self.context.current_table.clone(),
        );
        self.context.bind_variable(format!("%{name}"), binding);
        Ok(input.clone())
    }

    /// The whole document of the current row.
    fn root_document(&self) -> String {
        if self.context.current_table == self.root_table {
            format!("{SOURCE_ALIAS}.{}", self.resource_column)
        } else {
            format!("{SOURCE_ALIAS}.resource")
        }
    }

    fn is_root_type(&self, name: &str) -> bool {
        is_type_name(name)
            && self.context.at_root()
            && self
                .resource_type
                .as_deref()
                .is_none_or(|resource_type| resource_type == name)
    }

    // ------------------------------------------------------------------
    // Type operations
    // ------------------------------------------------------------------

    /// Resolve `is`/`as`/`ofType` on `input`, returning the discriminator field used.
    pub(crate) fn resolve_type(
        &self,
        input: &Expr,
        kind: TypeOperationKind,
        target: &str,
    ) -> Result<(Expr, Option<String>)> {
        let dialect = self.dialect();
        let element = input
            .navigation
            .as_ref()
            .and_then(|navigation| navigation.path.last().map(String::as_str));

        match types::resolve(element, target) {
            TypeTarget::ChoiceField(field) => {
                let mut navigation = input.navigation.clone().ok_or_else(|| {
                    Error::InvalidPath(format!("cannot resolve {target} without a path"))
                })?;
                navigation.path.pop();
                navigation.path.push(field.clone());
                let typed = Expr::navigation(dialect, navigation);
                let result = match kind {
                    TypeOperationKind::Is => {
                        Expr::new(dialect.json_exists(&typed.sql), ValueType::Boolean)
                    }
                    _ => typed,
                };
                Ok((result, Some(field)))
            }
            TypeTarget::Resource(resource_type) => {
                let resource_type_text = match &input.navigation {
                    Some(navigation) => navigation.child("resourceType").text(dialect),
                    None => Navigation::new(grouped(&input.json(dialect)), Vec::new(), false)
                        .child("resourceType")
                        .text(dialect),
                };
                let check = dialect.comparison(
                    "=",
                    &resource_type_text,
                    &quote_literal(&resource_type),
                );
                let result = match kind {
                    TypeOperationKind::Is => Expr::new(check, ValueType::Boolean),
                    _ => Expr::new(
                        format!("(CASE WHEN {check} THEN {} END)", input.json(dialect)),
                        ValueType::Json,
                    ),
                };
                Ok((result, Some("resourceType".to_string())))
            }
            TypeTarget::Datatype(_) => {
                let value = input.json(dialect);
                let exists = dialect.json_exists(&value);
                let result = match kind {
                    TypeOperationKind::Is => Expr::new(exists, ValueType::Boolean),
                    _ => Expr::new(
                        format!("(CASE WHEN {exists} THEN {value} END)"),
                        ValueType::Json,
                    ),
                };
                Ok((result, None))
            }
        }
    }
}

fn result_column() -> String {
    format!("{SOURCE_ALIAS}.{RESULT_COLUMN}")
}

/// Variables that always hold one document or one collection element.
fn binding_is_item(name: &str) -> bool {
    matches!(name, "$this" | "%resource" | "%context" | "%rootResource")
}

/// Capitalized identifiers name types rather than fields.
fn is_type_name(name: &str) -> bool {
    name.trim_matches('`')
        .starts_with(|c: char| c.is_ascii_uppercase())
}

/// Guard returned by [`Translator::enter_scope`].
pub struct ScopedTranslator<'t> {
    translator: &'t mut Translator,
    snapshot: Option<ContextSnapshot>,
}

impl Deref for ScopedTranslator<'_> {
    type Target = Translator;

    fn deref(&self) -> &Translator {
        self.translator
    }
}

impl DerefMut for ScopedTranslator<'_> {
    fn deref_mut(&mut self) -> &mut Translator {
        self.translator
    }
}

impl Drop for ScopedTranslator<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.translator.context.restore(snapshot);
        }
    }
}
