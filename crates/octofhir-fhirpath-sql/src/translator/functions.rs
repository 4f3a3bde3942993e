//! Function lookup table and per-function SQL routines.

use std::sync::Arc;

use crate::ast::{AstNode, LiteralType, NodeKind, SqlDataType, TypeOperationKind};
use crate::context::ValueType;
use crate::dialect::{MathFunction, SqlDialect, StringFunction};
use crate::{Error, Result};

use super::{Expr, Navigation, Translator, grouped};

/// Supported FHIRPath functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FhirFunction {
    Where,
    Select,
    First,
    Last,
    Tail,
    Skip,
    Take,
    Empty,
    Not,
    Exists,
    Count,
    Distinct,
    HasValue,
    Iif,
    Extension,
    DefineVariable,
    OfType,
    Is,
    As,
    Length,
    Substring,
    IndexOf,
    Replace,
    Split,
    ToChars,
    Upper,
    Lower,
    Trim,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    Join,
    Abs,
    Ceiling,
    Floor,
    Round,
    Sqrt,
    Power,
    Exp,
    Ln,
    Log,
    Truncate,
    Sum,
    Average,
    Min,
    Max,
    ToString,
    ToInteger,
    ToDecimal,
    ToDate,
    ToDateTime,
    ToBoolean,
}

/// Every supported function, in lookup order.
const FUNCTIONS: &[FhirFunction] = &[
    FhirFunction::Where,
    FhirFunction::Select,
    FhirFunction::First,
    FhirFunction::Last,
    FhirFunction::Tail,
    FhirFunction::Skip,
    FhirFunction::Take,
    FhirFunction::Empty,
    FhirFunction::Not,
    FhirFunction::Exists,
    FhirFunction::Count,
    FhirFunction::Distinct,
    FhirFunction::HasValue,
    FhirFunction::Iif,
    FhirFunction::Extension,
    FhirFunction::DefineVariable,
    FhirFunction::OfType,
    FhirFunction::Is,
    FhirFunction::As,
    FhirFunction::Length,
    FhirFunction::Substring,
    FhirFunction::IndexOf,
    FhirFunction::Replace,
    FhirFunction::Split,
    FhirFunction::ToChars,
    FhirFunction::Upper,
    FhirFunction::Lower,
    FhirFunction::Trim,
    FhirFunction::StartsWith,
    FhirFunction::EndsWith,
    FhirFunction::Contains,
    FhirFunction::Matches,
    FhirFunction::Join,
    FhirFunction::Abs,
    FhirFunction::Ceiling,
    FhirFunction::Floor,
    FhirFunction::Round,
    FhirFunction::Sqrt,
    FhirFunction::Power,
    FhirFunction::Exp,
    FhirFunction::Ln,
    FhirFunction::Log,
    FhirFunction::Truncate,
    FhirFunction::Sum,
    FhirFunction::Average,
    FhirFunction::Min,
    FhirFunction::Max,
    FhirFunction::ToString,
    FhirFunction::ToInteger,
    FhirFunction::ToDecimal,
    FhirFunction::ToDate,
    FhirFunction::ToDateTime,
    FhirFunction::ToBoolean,
];

impl FhirFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        FUNCTIONS.iter().copied().find(|function| function.name() == name)
    }

    /// Resolve `name` and check it accepts `argument_count` arguments.
    pub fn lookup(name: &str, argument_count: usize) -> Result<Self> {
        let function =
            Self::from_name(name).ok_or_else(|| Error::UnknownFunction(name.to_string()))?;
        let (min, max) = function.arity();
        if argument_count < min || argument_count > max {
            return Err(Error::invalid_argument_count(
                name,
                function.expected_arguments(),
                argument_count,
            ));
        }
        Ok(function)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Where => "where",
            Self::Select => "select",
            Self::First => "first",
            Self::Last => "last",
            Self::Tail => "tail",
            Self::Skip => "skip",
            Self::Take => "take",
            Self::Empty => "empty",
            Self::Not => "not",
            Self::Exists => "exists",
            Self::Count => "count",
            Self::Distinct => "distinct",
            Self::HasValue => "hasValue",
            Self::Iif => "iif",
            Self::Extension => "extension",
            Self::DefineVariable => "defineVariable",
            Self::OfType => "ofType",
            Self::Is => "is",
            Self::As => "as",
            Self::Length => "length",
            Self::Substring => "substring",
            Self::IndexOf => "indexOf",
            Self::Replace => "replace",
            Self::Split => "split",
            Self::ToChars => "toChars",
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Trim => "trim",
            Self::StartsWith => "startsWith",
            Self::EndsWith => "endsWith",
            Self::Contains => "contains",
            Self::Matches => "matches",
            Self::Join => "join",
            Self::Abs => "abs",
            Self::Ceiling => "ceiling",
            Self::Floor => "floor",
            Self::Round => "round",
            Self::Sqrt => "sqrt",
            Self::Power => "power",
            Self::Exp => "exp",
            Self::Ln => "ln",
            Self::Log => "log",
            Self::Truncate => "truncate",
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::ToString => "toString",
            Self::ToInteger => "toInteger",
            Self::ToDecimal => "toDecimal",
            Self::ToDate => "toDate",
            Self::ToDateTime => "toDateTime",
            Self::ToBoolean => "toBoolean",
        }
    }

    /// Accepted argument counts, inclusive.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Self::Where
            | Self::Select
            | Self::Skip
            | Self::Take
            | Self::Extension
            | Self::OfType
            | Self::Is
            | Self::As
            | Self::IndexOf
            | Self::Split
            | Self::StartsWith
            | Self::EndsWith
            | Self::Contains
            | Self::Matches
            | Self::Power
            | Self::Log => (1, 1),
            Self::First
            | Self::Last
            | Self::Tail
            | Self::Empty
            | Self::Not
            | Self::Count
            | Self::Distinct
            | Self::HasValue
            | Self::Length
            | Self::ToChars
            | Self::Upper
            | Self::Lower
            | Self::Trim
            | Self::Abs
            | Self::Ceiling
            | Self::Floor
            | Self::Sqrt
            | Self::Exp
            | Self::Ln
            | Self::Truncate
            | Self::Sum
            | Self::Average
            | Self::Min
            | Self::Max
            | Self::ToString
            | Self::ToInteger
            | Self::ToDecimal
            | Self::ToDate
            | Self::ToDateTime
            | Self::ToBoolean => (0, 0),
            Self::Exists | Self::Join | Self::Round => (0, 1),
            Self::Iif => (2, 3),
            Self::DefineVariable | Self::Substring => (1, 2),
            Self::Replace => (2, 2),
        }
    }

    fn expected_arguments(self) -> String {
        match self.arity() {
            (min, max) if min == max => min.to_string(),
            (min, max) if max == min + 1 => format!("{min} or {max}"),
            (min, max) => format!("{min} to {max}"),
        }
    }

    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Self::Count | Self::Sum | Self::Average | Self::Min | Self::Max
        )
    }
}

/// The type named by the single argument of `ofType`/`is`/`as`.
pub(crate) fn type_argument(node: &AstNode) -> Result<String> {
    let argument = node.children.first().ok_or_else(|| {
        Error::invalid_argument_count(node.text.clone(), "1", node.children.len())
    })?;
    match &argument.kind {
        NodeKind::Identifier { name } => Ok(name.clone()),
        NodeKind::Literal {
            value,
            literal_type: LiteralType::String,
        } => Ok(value.clone()),
        NodeKind::PathExpression => {
            let parts: Option<Vec<&str>> = argument
                .children
                .iter()
                .map(AstNode::identifier_name)
                .collect();
            parts
                .map(|parts| parts.join("."))
                .ok_or_else(|| Error::InvalidPath(format!("'{argument}' is not a type name")))
        }
        _ => Err(Error::InvalidPath(format!("'{argument}' is not a type name"))),
    }
}

/// A name given as a string literal or bare identifier argument.
pub(crate) fn string_argument(node: &AstNode, index: usize) -> Result<String> {
    let argument = node.children.get(index).ok_or_else(|| {
        Error::invalid_argument_count(node.text.clone(), (index + 1).to_string(), node.children.len())
    })?;
    match &argument.kind {
        NodeKind::Literal {
            value,
            literal_type: LiteralType::String,
        } => Ok(value.clone()),
        NodeKind::Identifier { name } => Ok(name.clone()),
        NodeKind::PathExpression if argument.children.len() == 1 => {
            string_argument(argument, 0)
        }
        _ => Err(Error::InvalidPath(format!(
            "'{argument}' must be a string literal"
        ))),
    }
}

impl Translator {
    /// Translate a function call on `input` inline.
    pub(super) fn call(&mut self, name: &str, input: &Expr, node: &AstNode) -> Result<Expr> {
        let function = FhirFunction::lookup(name, node.arguments().len())?;
        self.apply_function(function, input, node)
    }

    pub(super) fn apply_function(
        &mut self,
        function: FhirFunction,
        input: &Expr,
        node: &AstNode,
    ) -> Result<Expr> {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let args = node.arguments();

        let expr = match function {
            FhirFunction::Where => self.filter(input, &args[0])?,
            FhirFunction::Select => self.project(input, &args[0])?,
            FhirFunction::First => self.element_at(input, None, false)?,
            FhirFunction::Last => self.element_at(input, None, true)?,
            FhirFunction::Tail => {
                let one = Expr::literal("1".to_string(), LiteralType::Integer, "1");
                self.skip(input, &one)
            }
            FhirFunction::Skip => {
                let count = self.argument(input, &args[0])?;
                self.skip(input, &count)
            }
            FhirFunction::Take => {
                let count = self.argument(input, &args[0])?;
                self.take(input, &count)
            }
            FhirFunction::Empty => {
                let sql = match input.ty {
                    ValueType::Json => format!("({} = 0)", d.array_length(&input.sql)),
                    _ => format!("({} IS NULL)", input.sql),
                };
                Expr::new(sql, ValueType::Boolean)
            }
            FhirFunction::Not => Expr::new(d.not(&input.boolean(d)), ValueType::Boolean),
            FhirFunction::Exists => match args.first() {
                Some(criteria) => {
                    let collection = input.json(d);
                    let alias = self.context.next_alias("e");
                    let body = self.lambda(
                        &collection,
                        &format!("{alias}.value"),
                        &format!("({alias}.ordinality - 1)"),
                        criteria,
                    )?;
                    Expr::new(
                        format!(
                            "(EXISTS (SELECT 1 FROM {} WHERE {}))",
                            d.unnest_source(&collection, &alias),
                            body.boolean(d)
                        ),
                        ValueType::Boolean,
                    )
                }
                None => {
                    let sql = match input.ty {
                        ValueType::Json => d.json_exists(&input.sql),
                        _ => format!("({} IS NOT NULL)", input.sql),
                    };
                    Expr::new(sql, ValueType::Boolean)
                }
            },
            FhirFunction::Count => {
                let sql = match input.ty {
                    ValueType::Json => d.array_length(&input.sql),
                    _ => format!("(CASE WHEN {} IS NULL THEN 0 ELSE 1 END)", input.sql),
                };
                Expr::new(sql, ValueType::Integer)
            }
            FhirFunction::Distinct => {
                let alias = self.context.next_alias("e");
                Expr::new(
                    format!(
                        "(SELECT {} FROM {})",
                        d.aggregate_distinct_json_array(&format!("{alias}.value")),
                        d.unnest_source(&input.json(d), &alias)
                    ),
                    ValueType::Json,
                )
            }
            FhirFunction::HasValue => Expr::new(
                format!("({} IS NOT NULL)", input.text(d)),
                ValueType::Boolean,
            ),
            FhirFunction::Iif => self.iif(input, args)?,
            FhirFunction::Extension => {
                let url = self.argument(input, &args[0])?.text(d);
                let extensions = member(d, input, "extension");
                let alias = self.context.next_alias("e");
                let value = format!("{alias}.value");
                Expr::new(
                    format!(
                        "(SELECT {} FROM {} WHERE {})",
                        d.aggregate_json_array(&value, &format!("{alias}.ordinality")),
                        d.unnest_source(&extensions.sql, &alias),
                        d.comparison("=", &d.extract_json_text(&value, &["url".to_string()]), &url)
                    ),
                    ValueType::Json,
                )
            }
            FhirFunction::DefineVariable => self.define_variable(input, node)?,
            FhirFunction::OfType | FhirFunction::Is | FhirFunction::As => {
                let target = type_argument(node)?;
                let kind = match function {
                    FhirFunction::Is => TypeOperationKind::Is,
                    FhirFunction::As => TypeOperationKind::As,
                    _ => TypeOperationKind::OfType,
                };
                self.resolve_type(input, kind, &target)?.0
            }

            FhirFunction::Length => string(d, StringFunction::Length, vec![input.text(d)])
                .with_type(ValueType::Integer),
            FhirFunction::Substring => {
                let text = input.text(d);
                let (start, _) = self.argument(input, &args[0])?.numeric(d);
                let mut parts = vec![text.clone(), start.clone()];
                if let Some(length) = args.get(1) {
                    parts.push(self.argument(input, length)?.numeric(d).0);
                }
                let substring = d.string_function(StringFunction::Substring, &parts);
                let length = d.string_function(StringFunction::Length, &[text]);
                Expr::new(
                    format!(
                        "(CASE WHEN {start} < 0 OR {start} >= {length} THEN NULL ELSE {substring} END)"
                    ),
                    ValueType::String,
                )
            }
            FhirFunction::IndexOf => {
                let needle = self.argument(input, &args[0])?.text(d);
                string(d, StringFunction::IndexOf, vec![input.text(d), needle])
                    .with_type(ValueType::Integer)
            }
            FhirFunction::Replace => {
                let pattern = self.argument(input, &args[0])?.text(d);
                let substitution = self.argument(input, &args[1])?.text(d);
                string(
                    d,
                    StringFunction::Replace,
                    vec![input.text(d), pattern, substitution],
                )
            }
            FhirFunction::Split => {
                let separator = self.argument(input, &args[0])?.text(d);
                Expr::new(
                    d.split_to_json_array(&input.text(d), &separator),
                    ValueType::Json,
                )
            }
            FhirFunction::ToChars => Expr::new(
                d.split_to_json_array(&input.text(d), "''"),
                ValueType::Json,
            ),
            FhirFunction::Upper => string(d, StringFunction::Upper, vec![input.text(d)]),
            FhirFunction::Lower => string(d, StringFunction::Lower, vec![input.text(d)]),
            FhirFunction::Trim => string(d, StringFunction::Trim, vec![input.text(d)]),
            FhirFunction::StartsWith | FhirFunction::EndsWith | FhirFunction::Contains => {
                let other = self.argument(input, &args[0])?.text(d);
                let template = match function {
                    FhirFunction::StartsWith => StringFunction::StartsWith,
                    FhirFunction::EndsWith => StringFunction::EndsWith,
                    _ => StringFunction::Contains,
                };
                string(d, template, vec![input.text(d), other]).with_type(ValueType::Boolean)
            }
            FhirFunction::Matches => {
                let pattern = self.argument(input, &args[0])?.text(d);
                Expr::new(d.regex_match(&input.text(d), &pattern), ValueType::Boolean)
            }
            FhirFunction::Join => {
                let separator = match args.first() {
                    Some(separator) => self.argument(input, separator)?.text(d),
                    None => d.string_literal(""),
                };
                let alias = self.context.next_alias("e");
                Expr::new(
                    format!(
                        "(SELECT {} FROM {})",
                        d.string_aggregate(
                            &d.json_to_text(&format!("{alias}.value")),
                            &separator,
                            &format!("{alias}.ordinality")
                        ),
                        d.unnest_source(&input.json(d), &alias)
                    ),
                    ValueType::String,
                )
            }

            FhirFunction::Abs => {
                let (value, ty) = input.numeric(d);
                Expr::new(d.math_function(MathFunction::Abs, &[value]), ty)
            }
            FhirFunction::Ceiling | FhirFunction::Floor | FhirFunction::Truncate => {
                let template = match function {
                    FhirFunction::Ceiling => MathFunction::Ceiling,
                    FhirFunction::Floor => MathFunction::Floor,
                    _ => MathFunction::Truncate,
                };
                let (value, _) = input.numeric(d);
                Expr::new(
                    d.cast(&d.math_function(template, &[value]), SqlDataType::Integer),
                    ValueType::Integer,
                )
            }
            FhirFunction::Round => {
                let (value, _) = input.numeric(d);
                let mut parts = vec![value];
                if let Some(precision) = args.first() {
                    parts.push(self.argument(input, precision)?.numeric(d).0);
                }
                Expr::new(d.math_function(MathFunction::Round, &parts), ValueType::Decimal)
            }
            FhirFunction::Sqrt => {
                let (value, _) = input.numeric(d);
                let sqrt = d.math_function(MathFunction::Sqrt, std::slice::from_ref(&value));
                Expr::new(
                    format!("(CASE WHEN {value} < 0 THEN NULL ELSE {sqrt} END)"),
                    ValueType::Decimal,
                )
            }
            FhirFunction::Power => {
                let (value, _) = input.numeric(d);
                let (exponent, _) = self.argument(input, &args[0])?.numeric(d);
                Expr::new(
                    d.math_function(MathFunction::Power, &[value, exponent]),
                    ValueType::Decimal,
                )
            }
            FhirFunction::Exp => {
                let (value, _) = input.numeric(d);
                Expr::new(d.math_function(MathFunction::Exp, &[value]), ValueType::Decimal)
            }
            FhirFunction::Ln => {
                let (value, _) = input.numeric(d);
                let ln = d.math_function(MathFunction::Ln, std::slice::from_ref(&value));
                Expr::new(
                    format!("(CASE WHEN {value} <= 0 THEN NULL ELSE {ln} END)"),
                    ValueType::Decimal,
                )
            }
            FhirFunction::Log => {
                let (value, _) = input.numeric(d);
                let (base, _) = self.argument(input, &args[0])?.numeric(d);
                let log = d.math_function(MathFunction::Log, &[value.clone(), base.clone()]);
                Expr::new(
                    format!(
                        "(CASE WHEN {value} <= 0 OR {base} <= 0 OR {base} = 1 THEN NULL ELSE {log} END)"
                    ),
                    ValueType::Decimal,
                )
            }

            FhirFunction::Sum | FhirFunction::Average | FhirFunction::Min | FhirFunction::Max => {
                let alias = self.context.next_alias("e");
                let element = Expr::new(format!("{alias}.value"), ValueType::Json);
                let (aggregate, ty) = self.aggregate_sql(function, &element);
                Expr::new(
                    format!(
                        "(SELECT {aggregate} FROM {})",
                        d.unnest_source(&input.json(d), &alias)
                    ),
                    ty,
                )
            }

            FhirFunction::ToString => Expr::new(input.text(d), ValueType::String),
            FhirFunction::ToInteger => match input.ty {
                ValueType::Boolean => Expr::new(
                    format!("(CASE WHEN {} THEN 1 ELSE 0 END)", input.sql),
                    ValueType::Integer,
                ),
                _ => input.coerce(d, SqlDataType::Integer),
            },
            FhirFunction::ToDecimal => input.coerce(d, SqlDataType::Decimal),
            FhirFunction::ToDate => input.coerce(d, SqlDataType::Date),
            FhirFunction::ToDateTime => input.coerce(d, SqlDataType::Timestamp),
            FhirFunction::ToBoolean => input.coerce(d, SqlDataType::Boolean),
        };
        Ok(expr)
    }

    /// SQL aggregate of `element` over grouped rows.
    pub(super) fn aggregate_sql(&self, function: FhirFunction, element: &Expr) -> (String, ValueType) {
        let d = self.dialect();
        let (number, _) = element.numeric(d);
        match function {
            FhirFunction::Count => (format!("COUNT({})", element.sql), ValueType::Integer),
            FhirFunction::Sum => (format!("SUM({number})"), ValueType::Decimal),
            FhirFunction::Average => (format!("AVG({number})"), ValueType::Decimal),
            FhirFunction::Min => (format!("MIN({number})"), ValueType::Decimal),
            _ => (format!("MAX({number})"), ValueType::Decimal),
        }
    }

    /// Inline `where(criteria)`.
    fn filter(&mut self, input: &Expr, criteria: &AstNode) -> Result<Expr> {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let collection = input.json(d);
        let alias = self.context.next_alias("e");
        let value = format!("{alias}.value");
        let body = self.lambda(
            &collection,
            &value,
            &format!("({alias}.ordinality - 1)"),
            criteria,
        )?;
        Ok(Expr::new(
            format!(
                "(SELECT {} FROM {} WHERE {})",
                d.aggregate_json_array(&value, &format!("{alias}.ordinality")),
                d.unnest_source(&collection, &alias),
                body.boolean(d)
            ),
            ValueType::Json,
        ))
    }

    /// Inline `select(projection)`; collection results are flattened in order.
    fn project(&mut self, input: &Expr, projection: &AstNode) -> Result<Expr> {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let collection = input.json(d);
        let alias = self.context.next_alias("e");
        let body = self.lambda(
            &collection,
            &format!("{alias}.value"),
            &format!("({alias}.ordinality - 1)"),
            projection,
        )?;

        let sql = if body.ty == ValueType::Json {
            let nested = self.context.next_alias("f");
            format!(
                "(SELECT {} FROM {} {})",
                d.aggregate_json_array(
                    &format!("{nested}.value"),
                    &format!("{alias}.ordinality, {nested}.ordinality")
                ),
                d.unnest_source(&collection, &alias),
                d.lateral_unnest(&body.sql, &nested)
            )
        } else {
            format!(
                "(SELECT {} FROM {} WHERE {} IS NOT NULL)",
                d.aggregate_json_array(&body.json(d), &format!("{alias}.ordinality")),
                d.unnest_source(&collection, &alias),
                body.sql
            )
        };
        Ok(Expr::new(sql, ValueType::Json))
    }

    fn iif(&mut self, input: &Expr, args: &[AstNode]) -> Result<Expr> {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let condition = self.argument(input, &args[0])?.boolean(d);
        let when_true = self.argument(input, &args[1])?;
        let when_false = match args.get(2) {
            Some(node) => Some(self.argument(input, node)?),
            None => None,
        };

        let same_type = when_false
            .as_ref()
            .is_none_or(|other| other.ty == when_true.ty || other.ty == ValueType::Null);
        let (ty, then_sql, else_sql) = if same_type {
            (
                when_true.ty,
                when_true.sql.clone(),
                when_false.map(|other| other.sql),
            )
        } else {
            (
                ValueType::Json,
                when_true.json(d),
                when_false.map(|other| other.json(d)),
            )
        };
        let sql = match else_sql {
            Some(else_sql) => format!("(CASE WHEN {condition} THEN {then_sql} ELSE {else_sql} END)"),
            None => format!("(CASE WHEN {condition} THEN {then_sql} END)"),
        };
        Ok(Expr::new(sql, ty))
    }

    // ------------------------------------------------------------------
    // Slicing
    // ------------------------------------------------------------------

    /// One element of `input` by position, or the first/last element.
    pub(super) fn element_at(
        &mut self,
        input: &Expr,
        index: Option<&Expr>,
        descending: bool,
    ) -> Result<Expr> {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();

        let offset = match index {
            None => None,
            Some(index) => match index.integer_literal() {
                Some(n) if n < 0 => return Ok(Expr::new("NULL", ValueType::Null)),
                Some(0) => None,
                Some(n) => Some(n.to_string()),
                None => Some(index.numeric(d).0),
            },
        };

        let alias = self.context.next_alias("e");
        let order = if descending { "DESC" } else { "ASC" };
        let mut query = format!(
            "SELECT {alias}.value FROM {} ORDER BY {alias}.ordinality {order} LIMIT 1",
            d.unnest_source(&input.json(d), &alias)
        );
        if let Some(offset) = &offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let sql = match index {
            Some(index) if index.integer_literal().is_none() => {
                let (position, _) = index.numeric(d);
                format!("(CASE WHEN {position} >= 0 THEN ({query}) END)")
            }
            _ => format!("({query})"),
        };
        Ok(Expr::new(sql, ValueType::Json))
    }

    /// `skip(count)`: every element after the first `count`.
    pub(super) fn skip(&mut self, input: &Expr, count: &Expr) -> Expr {
        let d = Arc::clone(&self.dialect);
        let offset = match count.integer_literal() {
            Some(n) if n <= 0 => return input.clone(),
            Some(n) => n.to_string(),
            None => format!("GREATEST({}, 0)", count.numeric(d.as_ref()).0),
        };
        self.window(input, None, Some(&offset))
    }

    /// `take(count)`: the first `count` elements.
    pub(super) fn take(&mut self, input: &Expr, count: &Expr) -> Expr {
        let d = Arc::clone(&self.dialect);
        match count.integer_literal() {
            Some(n) if n <= 0 => Expr::new(d.empty_json_array(), ValueType::Json),
            Some(n) => self.window(input, Some(&n.to_string()), None),
            None => {
                let limit = format!("GREATEST({}, 0)", count.numeric(d.as_ref()).0);
                let window = self.window(input, Some(&limit), None);
                Expr::new(
                    format!("COALESCE({}, {})", window.sql, d.empty_json_array()),
                    ValueType::Json,
                )
            }
        }
    }

    /// Ordered sub-collection of `input` as a JSON array.
    fn window(&mut self, input: &Expr, limit: Option<&str>, offset: Option<&str>) -> Expr {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let element = self.context.next_alias("e");
        let slice = self.context.next_alias("s");

        let mut query = format!(
            "SELECT {element}.value, {element}.ordinality FROM {} ORDER BY {element}.ordinality",
            d.unnest_source(&input.json(d), &element)
        );
        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }
        Expr::new(
            format!(
                "(SELECT {} FROM ({query}) AS {slice})",
                d.aggregate_json_array(&format!("{slice}.value"), &format!("{slice}.ordinality"))
            ),
            ValueType::Json,
        )
    }
}

/// Child member `field` of a JSON value.
fn member(d: &dyn SqlDialect, input: &Expr, field: &str) -> Expr {
    let navigation = match &input.navigation {
        Some(navigation) => navigation.child(field),
        None => Navigation::new(grouped(&input.json(d)), vec![field.to_string()], false),
    };
    Expr::navigation(d, navigation)
}

fn string(d: &dyn SqlDialect, function: StringFunction, args: Vec<String>) -> Expr {
    Expr::new(d.string_function(function, &args), ValueType::String)
}

impl Expr {
    fn with_type(mut self, ty: ValueType) -> Self {
        self.ty = ty;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;

    fn translate(ast: &AstNode) -> Vec<String> {
        let mut translator = Translator::new(Arc::new(PostgresDialect::new()));
        translator
            .translate(ast)
            .unwrap()
            .iter()
            .map(|f| f.expression().to_string())
            .collect()
    }

    fn name_then(function: AstNode) -> AstNode {
        AstNode::path(vec![
            AstNode::identifier("Patient"),
            AstNode::identifier("name"),
            function,
        ])
    }

    #[test]
    fn test_lookup_checks_arity() {
        assert_eq!(FhirFunction::lookup("first", 0).unwrap(), FhirFunction::First);

        let err = FhirFunction::lookup("empty", 1).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidArgumentCount { ref function, ref expected, actual: 1 }
                if function == "empty" && expected == "0"
        ));

        let err = FhirFunction::lookup("iif", 1).unwrap_err();
        assert!(err.to_string().contains("2 or 3"));

        let err = FhirFunction::lookup("frobnicate", 0).unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(ref name) if name == "frobnicate"));
    }

    #[test]
    fn test_every_function_resolves_by_its_name() {
        for function in FUNCTIONS {
            assert_eq!(FhirFunction::from_name(function.name()), Some(*function));
            let (min, max) = function.arity();
            assert!(min <= max, "{}", function.name());
        }
        assert_eq!(FUNCTIONS.len(), 54);
    }

    #[test]
    fn test_last_orders_descending_with_single_row() {
        let sql = translate(&name_then(AstNode::function("last", vec![])));
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("ORDER BY e1.ordinality DESC LIMIT 1"));
    }

    #[test]
    fn test_take_non_positive_is_empty() {
        let take = AstNode::function("take", vec![AstNode::literal("0", LiteralType::Integer)]);
        assert_eq!(translate(&name_then(take)), vec!["'[]'::jsonb"]);
    }

    #[test]
    fn test_skip_non_positive_is_identity() {
        let skip = AstNode::function(
            "skip",
            vec![AstNode::operator(
                "-",
                vec![AstNode::literal("2", LiteralType::Integer)],
            )],
        );
        let sql = translate(&name_then(skip));
        assert!(sql[0].contains("GREATEST((-2), 0)"));

        let skip = AstNode::function("skip", vec![AstNode::literal("0", LiteralType::Integer)]);
        assert_eq!(translate(&name_then(skip)), vec!["src.resource->'name'"]);
    }

    #[test]
    fn test_sqrt_guards_negative_input() {
        let ast = AstNode::path(vec![
            AstNode::literal("4", LiteralType::Integer),
            AstNode::function("sqrt", vec![]),
        ]);
        let sql = translate(&ast);
        assert_eq!(sql.last().unwrap(), "(CASE WHEN 4 < 0 THEN NULL ELSE SQRT(4) END)");
    }

    #[test]
    fn test_substring_guards_start() {
        let ast = AstNode::path(vec![
            AstNode::identifier("id"),
            AstNode::function(
                "substring",
                vec![
                    AstNode::literal("1", LiteralType::Integer),
                    AstNode::literal("2", LiteralType::Integer),
                ],
            ),
        ]);
        let sql = translate(&ast);
        assert_eq!(
            sql[0],
            "(CASE WHEN 1 < 0 OR 1 >= LENGTH(src.resource->>'id') THEN NULL \
             ELSE SUBSTRING(src.resource->>'id', (1) + 1, 2) END)"
        );
    }

    #[test]
    fn test_extension_filters_by_url() {
        let ast = AstNode::path(vec![
            AstNode::identifier("Patient"),
            AstNode::function(
                "extension",
                vec![AstNode::literal("http://example.org/race", LiteralType::String)],
            ),
        ]);
        let sql = translate(&ast);
        assert!(sql[0].contains("src.resource->'extension'"));
        assert!(sql[0].contains("(e1.value->>'url' = 'http://example.org/race')"));
    }
}
