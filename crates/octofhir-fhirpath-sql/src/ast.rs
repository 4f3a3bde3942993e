//! Typed AST for FHIRPath expressions.
//!
//! Trees are built by a parser (see [`crate::parser`]) and only borrowed by
//! the translator. Every node owns its children; there are no back references.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A node of the expression tree.
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    /// Variant specific data.
    pub kind: NodeKind,

    /// Source text this node was parsed from, used in diagnostics.
    pub text: String,

    /// Ordered child nodes (operands, arguments or path steps).
    pub children: Vec<AstNode>,

    /// Optional analysis results attached by the AST builder.
    pub metadata: Option<NodeMetadata>,
}

/// Node variants.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A literal value such as `'official'`, `42` or `@2018-03-01`.
    Literal {
        value: String,
        literal_type: LiteralType,
    },
    /// A member name, `$variable` or `%environment` reference.
    Identifier { name: String },
    /// A unary or binary operator; operands are the children.
    Operator { symbol: String, arity: Arity },
    /// A function invocation; arguments are the children.
    FunctionCall { name: String },
    /// `is`, `as` or `ofType` with the type it tests or casts to.
    TypeOperation {
        kind: TypeOperationKind,
        target_type: String,
    },
    /// A chain of navigation steps; the steps are the children.
    PathExpression,
}

/// Literal value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LiteralType {
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Quantity,
    /// The empty collection `{}`.
    Null,
}

impl LiteralType {
    /// FHIRPath name of the type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "dateTime",
            Self::Time => "time",
            Self::Quantity => "Quantity",
            Self::Null => "null",
        }
    }

    /// Whether this is a date, dateTime or time literal.
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Date | Self::DateTime | Self::Time)
    }

    /// Whether this is an integer or decimal literal.
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Decimal)
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Unary,
    Binary,
}

impl Arity {
    /// Number of operands the operator requires.
    pub fn operand_count(self) -> usize {
        match self {
            Self::Unary => 1,
            Self::Binary => 2,
        }
    }
}

/// Type operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOperationKind {
    Is,
    As,
    OfType,
}

impl TypeOperationKind {
    /// Resolve the kind from its FHIRPath keyword or function name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "is" => Some(Self::Is),
            "as" => Some(Self::As),
            "ofType" => Some(Self::OfType),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Is => "is",
            Self::As => "as",
            Self::OfType => "ofType",
        }
    }
}

/// Broad classification of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    Literal,
    PathNavigation,
    Variable,
    Arithmetic,
    Comparison,
    Logical,
    StringOperation,
    Collection,
    Aggregate,
    TypeOperation,
    Function,
}

/// Hints the AST builder can attach for the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationHint {
    /// The node is a constant and can be folded.
    Constant,
    /// The node navigates into an array and needs unnesting.
    RequiresUnnest,
    /// The node can be computed with a grouped aggregate.
    Aggregatable,
    /// The node only reads the current document.
    DocumentLocal,
}

/// SQL data type inferred for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDataType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Time,
    Json,
}

/// Analysis results attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub category: NodeCategory,

    #[serde(default)]
    pub optimization_hints: BTreeSet<OptimizationHint>,

    /// SQL type the node evaluates to, when known.
    pub sql_data_type: Option<SqlDataType>,

    /// FHIR type of the node (e.g. `HumanName`, `string`), when known.
    pub fhir_type: Option<String>,

    /// The node must be evaluated against a single record.
    #[serde(default)]
    pub requires_record_context: bool,

    /// The node may be computed with a population aggregate.
    #[serde(default)]
    pub aggregation_safe: bool,
}

impl NodeMetadata {
    pub fn new(category: NodeCategory) -> Self {
        Self {
            category,
            optimization_hints: BTreeSet::new(),
            sql_data_type: None,
            fhir_type: None,
            requires_record_context: false,
            aggregation_safe: false,
        }
    }

    /// Derive default metadata from a node variant.
    pub fn for_kind(kind: &NodeKind) -> Self {
        let category = match kind {
            NodeKind::Literal { .. } => NodeCategory::Literal,
            NodeKind::Identifier { name } if name.starts_with('$') || name.starts_with('%') => {
                NodeCategory::Variable
            }
            NodeKind::Identifier { .. } | NodeKind::PathExpression => NodeCategory::PathNavigation,
            NodeKind::Operator { symbol, .. } => match symbol.as_str() {
                "+" | "-" | "*" | "/" | "div" | "mod" => NodeCategory::Arithmetic,
                "=" | "!=" | "~" | "!~" | "<" | ">" | "<=" | ">=" => NodeCategory::Comparison,
                "and" | "or" | "xor" | "implies" => NodeCategory::Logical,
                "&" => NodeCategory::StringOperation,
                _ => NodeCategory::Collection,
            },
            NodeKind::FunctionCall { name } => match name.as_str() {
                "count" | "sum" | "average" | "min" | "max" => NodeCategory::Aggregate,
                "where" | "select" | "first" | "last" | "tail" | "skip" | "take" | "exists"
                | "empty" | "distinct" => NodeCategory::Collection,
                _ => NodeCategory::Function,
            },
            NodeKind::TypeOperation { .. } => NodeCategory::TypeOperation,
        };

        let mut metadata = Self::new(category);
        match kind {
            NodeKind::Literal { literal_type, .. } => {
                metadata.optimization_hints.insert(OptimizationHint::Constant);
                metadata.sql_data_type = match literal_type {
                    LiteralType::String => Some(SqlDataType::Text),
                    LiteralType::Integer => Some(SqlDataType::Integer),
                    LiteralType::Decimal => Some(SqlDataType::Decimal),
                    LiteralType::Boolean => Some(SqlDataType::Boolean),
                    LiteralType::Date => Some(SqlDataType::Date),
                    LiteralType::DateTime => Some(SqlDataType::Timestamp),
                    LiteralType::Time => Some(SqlDataType::Time),
                    LiteralType::Quantity | LiteralType::Null => None,
                };
            }
            NodeKind::FunctionCall { name } if category == NodeCategory::Aggregate => {
                metadata.aggregation_safe = true;
                metadata.optimization_hints.insert(OptimizationHint::Aggregatable);
                if name == "count" {
                    metadata.sql_data_type = Some(SqlDataType::Integer);
                }
            }
            NodeKind::FunctionCall { name } if name == "where" || name == "select" => {
                metadata.requires_record_context = true;
                metadata.optimization_hints.insert(OptimizationHint::RequiresUnnest);
            }
            _ => {
                metadata.optimization_hints.insert(OptimizationHint::DocumentLocal);
            }
        }
        metadata
    }

    #[must_use]
    pub fn with_sql_data_type(mut self, sql_data_type: SqlDataType) -> Self {
        self.sql_data_type = Some(sql_data_type);
        self
    }

    #[must_use]
    pub fn with_fhir_type(mut self, fhir_type: impl Into<String>) -> Self {
        self.fhir_type = Some(fhir_type.into());
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: OptimizationHint) -> Self {
        self.optimization_hints.insert(hint);
        self
    }
}

impl AstNode {
    fn from_kind(kind: NodeKind, text: impl Into<String>, children: Vec<AstNode>) -> Self {
        Self {
            kind,
            text: text.into(),
            children,
            metadata: None,
        }
    }

    /// A literal node; `text` is the source form.
    pub fn literal(value: impl Into<String>, literal_type: LiteralType) -> Self {
        let value = value.into();
        let text = match literal_type {
            LiteralType::String => format!("'{}'", value.replace('\'', "\\'")),
            LiteralType::Date | LiteralType::DateTime | LiteralType::Time => format!("@{value}"),
            LiteralType::Null => "{}".to_string(),
            _ => value.clone(),
        };
        Self::from_kind(
            NodeKind::Literal {
                value,
                literal_type,
            },
            text,
            Vec::new(),
        )
    }

    pub fn identifier(name: impl Into<String>) -> Self {
        let name = name.into();
        let text = name.clone();
        Self::from_kind(NodeKind::Identifier { name }, text, Vec::new())
    }

    /// A binary or unary operator, arity taken from the operand count.
    pub fn operator(symbol: impl Into<String>, operands: Vec<AstNode>) -> Self {
        let symbol = symbol.into();
        let arity = if operands.len() == 1 {
            Arity::Unary
        } else {
            Arity::Binary
        };
        let text = match operands.as_slice() {
            [operand] => format!("{symbol}{}", operand.text),
            [left, right] => format!("{} {symbol} {}", left.text, right.text),
            _ => symbol.clone(),
        };
        Self::from_kind(NodeKind::Operator { symbol, arity }, text, operands)
    }

    /// An operator with an explicit arity, regardless of the operand count.
    pub fn operator_with_arity(
        symbol: impl Into<String>,
        arity: Arity,
        operands: Vec<AstNode>,
    ) -> Self {
        let mut node = Self::operator(symbol, operands);
        if let NodeKind::Operator { arity: a, .. } = &mut node.kind {
            *a = arity;
        }
        node
    }

    pub fn function(name: impl Into<String>, arguments: Vec<AstNode>) -> Self {
        let name = name.into();
        let args = arguments
            .iter()
            .map(|a| a.text.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!("{name}({args})");
        Self::from_kind(NodeKind::FunctionCall { name }, text, arguments)
    }

    /// A type operation; `operand` is `None` when it applies to the current path.
    pub fn type_operation(
        kind: TypeOperationKind,
        target_type: impl Into<String>,
        operand: Option<AstNode>,
    ) -> Self {
        let target_type = target_type.into();
        let text = match &operand {
            Some(node) => format!("{} {} {}", node.text, kind.as_str(), target_type),
            None => format!("{}({})", kind.as_str(), target_type),
        };
        Self::from_kind(
            NodeKind::TypeOperation { kind, target_type },
            text,
            operand.into_iter().collect(),
        )
    }

    pub fn path(steps: Vec<AstNode>) -> Self {
        let text = steps
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(".");
        Self::from_kind(NodeKind::PathExpression, text, steps)
    }

    /// Attach metadata to this node.
    #[must_use]
    pub fn with_metadata(mut self, metadata: NodeMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach metadata derived from the node variant, recursively.
    #[must_use]
    pub fn with_default_metadata(mut self) -> Self {
        self.children = self
            .children
            .into_iter()
            .map(AstNode::with_default_metadata)
            .collect();
        if self.metadata.is_none() {
            self.metadata = Some(NodeMetadata::for_kind(&self.kind));
        }
        self
    }

    /// Function arguments (the children of a function call).
    pub fn arguments(&self) -> &[AstNode] {
        &self.children
    }

    /// Identifier name, if this node is an identifier.
    pub fn identifier_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Identifier { name } => Some(name),
            _ => None,
        }
    }

    /// SQL data type from the attached metadata.
    pub fn sql_data_type(&self) -> Option<SqlDataType> {
        self.metadata.as_ref().and_then(|m| m.sql_data_type)
    }

    /// Number of nodes in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(AstNode::node_count).sum::<usize>()
    }
}

impl fmt::Display for AstNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_text_joins_steps() {
        let node = AstNode::path(vec![
            AstNode::identifier("Patient"),
            AstNode::identifier("name"),
            AstNode::function("first", vec![]),
        ]);
        assert_eq!(node.text, "Patient.name.first()");
        assert_eq!(node.node_count(), 4);
    }

    #[test]
    fn test_operator_arity_follows_operands() {
        let unary = AstNode::operator("-", vec![AstNode::literal("5", LiteralType::Integer)]);
        assert!(matches!(
            unary.kind,
            NodeKind::Operator {
                arity: Arity::Unary,
                ..
            }
        ));

        let binary = AstNode::operator(
            "+",
            vec![
                AstNode::literal("1", LiteralType::Integer),
                AstNode::literal("2", LiteralType::Integer),
            ],
        );
        assert_eq!(binary.text, "1 + 2");
    }

    #[test]
    fn test_default_metadata_categories() {
        let node = AstNode::path(vec![
            AstNode::identifier("name"),
            AstNode::function("count", vec![]),
        ])
        .with_default_metadata();

        let count = &node.children[1];
        let metadata = count.metadata.as_ref().unwrap();
        assert_eq!(metadata.category, NodeCategory::Aggregate);
        assert!(metadata.aggregation_safe);
        assert_eq!(metadata.sql_data_type, Some(SqlDataType::Integer));

        let var = AstNode::identifier("$this").with_default_metadata();
        assert_eq!(var.metadata.unwrap().category, NodeCategory::Variable);
    }

    #[test]
    fn test_literal_metadata_is_constant() {
        let metadata = NodeMetadata::for_kind(&NodeKind::Literal {
            value: "2018-03".into(),
            literal_type: LiteralType::Date,
        });
        assert!(metadata.optimization_hints.contains(&OptimizationHint::Constant));
        assert_eq!(metadata.sql_data_type, Some(SqlDataType::Date));
    }

    #[test]
    fn test_type_operation_text() {
        let node = AstNode::type_operation(
            TypeOperationKind::As,
            "Quantity",
            Some(AstNode::identifier("value")),
        );
        assert_eq!(node.text, "value as Quantity");
        assert_eq!(TypeOperationKind::from_name("ofType"), Some(TypeOperationKind::OfType));
    }
}
