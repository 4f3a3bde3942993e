//! Database specific SQL syntax.
//!
//! The translator and CTE builder never write database specific syntax
//! themselves; every primitive goes through [`SqlDialect`]. Default method
//! bodies are plain ANSI SQL and dialects override what differs.

mod duckdb;
mod postgres;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use crate::ast::SqlDataType;
pub use duckdb::DuckDbDialect;
pub use postgres::PostgresDialect;

/// String functions with per-dialect templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFunction {
    /// `length(text)`
    Length,
    /// `substring(text, start0 [, length])`, start is zero based
    Substring,
    /// `indexOf(text, needle)`, zero based, -1 when absent
    IndexOf,
    /// `replace(text, pattern, substitution)`
    Replace,
    Upper,
    Lower,
    Trim,
    StartsWith,
    EndsWith,
    Contains,
}

/// Math functions with per-dialect templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFunction {
    Abs,
    Ceiling,
    Floor,
    /// `round(value [, precision])`
    Round,
    Sqrt,
    /// `power(base, exponent)`
    Power,
    Exp,
    Ln,
    /// `log(value, base)`
    Log,
    Truncate,
}

/// Boolean connectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
    Xor,
    Implies,
}

impl LogicalOperator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "xor" => Some(Self::Xor),
            "implies" => Some(Self::Implies),
            _ => None,
        }
    }
}

/// Quote a string as an SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Per-database SQL syntax provider.
pub trait SqlDialect: Send + Sync + fmt::Debug {
    /// Dialect name used in logs.
    fn name(&self) -> &'static str;

    // ------------------------------------------------------------------
    // JSON navigation
    // ------------------------------------------------------------------

    /// Extract the JSON value at `path` below `base`.
    fn extract_json_object(&self, base: &str, path: &[String]) -> String;

    /// Extract the value at `path` below `base` as text.
    fn extract_json_text(&self, base: &str, path: &[String]) -> String;

    /// Follow `path` from `base`, unwrapping collections at every step.
    ///
    /// Yields NULL when nothing is reached, the value itself when exactly one
    /// value is reached, and a JSON array in document order otherwise. Unless
    /// `base_is_item`, `base` itself is treated as a collection.
    fn flatten_json_path(&self, base: &str, path: &[String], base_is_item: bool) -> String {
        let mut sources: Vec<String> = Vec::new();
        let mut order = Vec::new();
        let mut current = base.to_string();
        let mut step = |array: String, alias: String, sources: &mut Vec<String>| {
            sources.push(if sources.is_empty() {
                self.unnest_source(&array, &alias)
            } else {
                self.lateral_unnest(&array, &alias)
            });
            order.push(format!("{alias}.ordinality"));
            format!("{alias}.value")
        };
        if !base_is_item {
            current = step(current, "nav0".to_string(), &mut sources);
        }
        for (depth, field) in path.iter().enumerate() {
            let array = self.extract_json_object(&current, std::slice::from_ref(field));
            current = step(array, format!("nav{}", depth + 1), &mut sources);
        }
        let values = self.aggregate_json_array(&current, &order.join(", "));
        format!(
            "(SELECT CASE COUNT(*) WHEN 0 THEN NULL WHEN 1 THEN {} ELSE {values} END FROM {})",
            self.json_array_element(&values, 0),
            sources.join(" ")
        )
    }

    /// Element `index` (zero based) of a JSON array.
    fn json_array_element(&self, array: &str, index: usize) -> String;

    /// Convert a JSON scalar to text.
    fn json_to_text(&self, expr: &str) -> String;

    /// Convert an SQL value to JSON.
    fn to_json(&self, expr: &str) -> String;

    /// True when the JSON value is present and not an empty collection.
    fn json_exists(&self, expr: &str) -> String;

    /// Normalize a JSON value to an array: NULL becomes `[]`, scalars are wrapped.
    fn json_array(&self, expr: &str) -> String;

    /// Number of elements of a JSON collection (0 for NULL).
    fn array_length(&self, expr: &str) -> String;

    /// FROM item iterating a JSON collection with columns
    /// `<alias>.value` and `<alias>.ordinality` (one based).
    fn unnest_source(&self, array_expr: &str, alias: &str) -> String;

    /// Join clause unnesting a JSON collection for each row of the left side.
    fn lateral_unnest(&self, array_expr: &str, alias: &str) -> String {
        format!("CROSS JOIN LATERAL {}", self.unnest_source(array_expr, alias))
    }

    /// Like [`SqlDialect::lateral_unnest`], keeping left rows with nothing to unnest.
    fn left_lateral_unnest(&self, array_expr: &str, alias: &str) -> String {
        format!("LEFT JOIN LATERAL {} ON TRUE", self.unnest_source(array_expr, alias))
    }

    /// Ordered aggregation of JSON values into a JSON array.
    fn aggregate_json_array(&self, value: &str, order_by: &str) -> String;

    /// Aggregation of distinct JSON values into a JSON array.
    fn aggregate_distinct_json_array(&self, value: &str) -> String;

    fn empty_json_array(&self) -> String;

    /// Ordered string aggregation.
    fn string_aggregate(&self, value: &str, separator: &str, order_by: &str) -> String {
        format!("string_agg({value}, {separator} ORDER BY {order_by})")
    }

    /// Split text into a JSON array of strings; an empty separator splits characters.
    fn split_to_json_array(&self, text: &str, separator: &str) -> String;

    // ------------------------------------------------------------------
    // Literals and casts
    // ------------------------------------------------------------------

    fn string_literal(&self, value: &str) -> String {
        quote_literal(value)
    }

    fn date_literal(&self, value: &str) -> String {
        format!("DATE '{value}'")
    }

    fn datetime_literal(&self, value: &str) -> String {
        format!("TIMESTAMP '{value}'")
    }

    fn time_literal(&self, value: &str) -> String {
        format!("TIME '{value}'")
    }

    fn boolean_literal(&self, value: bool) -> String {
        let literal = if value { "TRUE" } else { "FALSE" };
        literal.to_string()
    }

    /// Database type name for a cast target.
    fn type_name(&self, sql_type: SqlDataType) -> &'static str;

    fn cast(&self, expr: &str, sql_type: SqlDataType) -> String {
        format!("CAST({expr} AS {})", self.type_name(sql_type))
    }

    /// Cast that yields NULL instead of failing on malformed input.
    fn safe_cast(&self, expr: &str, sql_type: SqlDataType) -> String;

    fn typed_null(&self, sql_type: SqlDataType) -> String {
        self.cast("NULL", sql_type)
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    /// String concatenation treating NULL as the empty string.
    fn string_concat(&self, left: &str, right: &str) -> String {
        format!("(COALESCE({left}, '') || COALESCE({right}, ''))")
    }

    /// `+ - * /` between numeric operands.
    fn arithmetic(&self, operator: &str, left: &str, right: &str) -> String {
        format!("({left} {operator} {right})")
    }

    /// Integer division truncating toward zero.
    fn integer_division(&self, left: &str, right: &str) -> String;

    fn modulo(&self, left: &str, right: &str) -> String {
        format!("({left} % {right})")
    }

    fn comparison(&self, operator: &str, left: &str, right: &str) -> String {
        let operator = if operator == "!=" { "<>" } else { operator };
        format!("({left} {operator} {right})")
    }

    fn logical(&self, operator: LogicalOperator, left: &str, right: &str) -> String {
        match operator {
            LogicalOperator::And => format!("({left} AND {right})"),
            LogicalOperator::Or => format!("({left} OR {right})"),
            LogicalOperator::Xor => format!("({left} <> {right})"),
            LogicalOperator::Implies => format!("(NOT {left} OR {right})"),
        }
    }

    fn not(&self, expr: &str) -> String {
        format!("(NOT {expr})")
    }

    fn regex_match(&self, expr: &str, pattern: &str) -> String;

    // ------------------------------------------------------------------
    // Function templates
    // ------------------------------------------------------------------

    fn string_function(&self, function: StringFunction, args: &[String]) -> String {
        ansi_string_function(function, args)
    }

    fn math_function(&self, function: MathFunction, args: &[String]) -> String {
        ansi_math_function(function, args)
    }

    /// Row numbering restarted for every partition.
    fn row_number(&self, partition_by: &str, order_by: &str) -> String {
        format!("ROW_NUMBER() OVER (PARTITION BY {partition_by} ORDER BY {order_by})")
    }
}

/// ANSI string function templates shared by all dialects.
pub(crate) fn ansi_string_function(function: StringFunction, args: &[String]) -> String {
    let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("NULL");
    match function {
        StringFunction::Length => format!("LENGTH({})", arg(0)),
        StringFunction::Substring => match args.get(2) {
            Some(length) => format!("SUBSTRING({}, ({}) + 1, {length})", arg(0), arg(1)),
            None => format!("SUBSTRING({}, ({}) + 1)", arg(0), arg(1)),
        },
        StringFunction::IndexOf => format!("(STRPOS({}, {}) - 1)", arg(0), arg(1)),
        StringFunction::Replace => format!("REPLACE({}, {}, {})", arg(0), arg(1), arg(2)),
        StringFunction::Upper => format!("UPPER({})", arg(0)),
        StringFunction::Lower => format!("LOWER({})", arg(0)),
        StringFunction::Trim => format!("TRIM({})", arg(0)),
        StringFunction::StartsWith => {
            format!("(LEFT({0}, LENGTH({1})) = {1})", arg(0), arg(1))
        }
        StringFunction::EndsWith => {
            format!("(RIGHT({0}, LENGTH({1})) = {1})", arg(0), arg(1))
        }
        StringFunction::Contains => format!("(STRPOS({}, {}) > 0)", arg(0), arg(1)),
    }
}

/// ANSI math function templates shared by all dialects.
pub(crate) fn ansi_math_function(function: MathFunction, args: &[String]) -> String {
    let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("NULL");
    match function {
        MathFunction::Abs => format!("ABS({})", arg(0)),
        MathFunction::Ceiling => format!("CEIL({})", arg(0)),
        MathFunction::Floor => format!("FLOOR({})", arg(0)),
        MathFunction::Round => match args.get(1) {
            Some(precision) => format!("ROUND({}, {precision})", arg(0)),
            None => format!("ROUND({})", arg(0)),
        },
        MathFunction::Sqrt => format!("SQRT({})", arg(0)),
        MathFunction::Power => format!("POWER({}, {})", arg(0), arg(1)),
        MathFunction::Exp => format!("EXP({})", arg(0)),
        MathFunction::Ln => format!("LN({})", arg(0)),
        MathFunction::Log => format!("LOG({}, {})", arg(1), arg(0)),
        MathFunction::Truncate => format!("TRUNC({})", arg(0)),
    }
}

/// Built-in dialects selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    Postgres,
    DuckDb,
}

impl DialectKind {
    /// Instantiate the dialect.
    pub fn create(self) -> Arc<dyn SqlDialect> {
        match self {
            Self::Postgres => Arc::new(PostgresDialect::new()),
            Self::DuckDb => Arc::new(DuckDbDialect::new()),
        }
    }
}
