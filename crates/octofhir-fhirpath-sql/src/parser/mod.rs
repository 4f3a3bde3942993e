//! Expression parsing.
//!
//! The executor only depends on the [`ExpressionParser`] trait. [`FhirPathParser`]
//! is a small built-in implementation covering the FHIRPath subset the
//! translator understands; any other parser producing an [`AstNode`] tree can
//! be injected instead.

mod lexer;

use tracing::trace;

use crate::ast::{AstNode, LiteralType, NodeKind, TypeOperationKind};
use lexer::{Spanned, Token};

/// Calendar duration units accepted after a number as a quantity.
const CALENDAR_UNITS: &[&str] = &[
    "year",
    "years",
    "month",
    "months",
    "week",
    "weeks",
    "day",
    "days",
    "hour",
    "hours",
    "minute",
    "minutes",
    "second",
    "seconds",
    "millisecond",
    "milliseconds",
];

/// Information available to the parser about the expression's input.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    /// Resource type the expression is evaluated against.
    pub resource_type: Option<String>,

    /// Attach default [`crate::NodeMetadata`] to every node.
    pub attach_metadata: bool,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, attach_metadata: bool) -> Self {
        self.attach_metadata = attach_metadata;
        self
    }
}

/// Outcome of parsing one expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    ast: Option<AstNode>,
    errors: Vec<String>,
}

impl ParseResult {
    pub fn valid(ast: AstNode) -> Self {
        Self {
            ast: Some(ast),
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self { ast: None, errors }
    }

    pub fn is_valid(&self) -> bool {
        self.ast.is_some() && self.errors.is_empty()
    }

    pub fn ast(&self) -> Option<&AstNode> {
        self.ast.as_ref()
    }

    pub fn into_ast(self) -> Option<AstNode> {
        self.ast
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

/// Turns expression text into an AST.
pub trait ExpressionParser: Send + Sync {
    /// Parse `expression`.
    ///
    /// Syntax errors are reported through an invalid [`ParseResult`]; an
    /// `Err` means the parser itself failed.
    fn parse(&self, expression: &str, context: &ParseContext) -> anyhow::Result<ParseResult>;
}

/// Precedence-climbing FHIRPath parser.
#[derive(Debug, Clone, Default)]
pub struct FhirPathParser;

impl FhirPathParser {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionParser for FhirPathParser {
    fn parse(&self, expression: &str, context: &ParseContext) -> anyhow::Result<ParseResult> {
        let tokens = match lexer::tokenize(expression) {
            Ok(tokens) => tokens,
            Err(message) => return Ok(ParseResult::invalid(vec![message])),
        };

        let mut parser = Parser {
            tokens,
            position: 0,
            input_len: expression.len(),
        };
        let ast = match parser.expression(0).and_then(|ast| parser.finish().map(|()| ast)) {
            Ok(ast) => ast,
            Err(message) => return Ok(ParseResult::invalid(vec![message])),
        };

        if let Some(expected) = &context.resource_type {
            if let Some(found) = root_type(&ast) {
                if found != expected {
                    return Ok(ParseResult::invalid(vec![format!(
                        "expression starts with {found} but is evaluated against {expected}"
                    )]));
                }
            }
        }

        trace!(nodes = ast.node_count(), "Parsed expression");
        let ast = if context.attach_metadata {
            ast.with_default_metadata()
        } else {
            ast
        };
        Ok(ParseResult::valid(ast))
    }
}

/// Leading type name of a path, if any.
fn root_type(ast: &AstNode) -> Option<&str> {
    let first = match ast.kind {
        NodeKind::PathExpression => ast.children.first()?,
        _ => ast,
    };
    first
        .identifier_name()
        .filter(|name| name.starts_with(|c: char| c.is_ascii_uppercase()))
}

/// Binding power and operator symbol of an infix keyword or symbol.
fn infix(token: &Token) -> Option<(u8, &'static str)> {
    let operator = match token {
        Token::Symbol(symbol) => match *symbol {
            "=" | "~" | "!=" | "!~" => (5, *symbol),
            "<" | ">" | "<=" | ">=" => (6, *symbol),
            "|" => (7, *symbol),
            "+" | "-" | "&" => (9, *symbol),
            "*" | "/" => (10, *symbol),
            _ => return None,
        },
        Token::Identifier(word) => match word.as_str() {
            "implies" => (1, "implies"),
            "or" => (2, "or"),
            "xor" => (2, "xor"),
            "and" => (3, "and"),
            "in" => (4, "in"),
            "contains" => (4, "contains"),
            "is" => (8, "is"),
            "as" => (8, "as"),
            "div" => (10, "div"),
            "mod" => (10, "mod"),
            _ => return None,
        },
        _ => return None,
    };
    Some(operator)
}

struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    input_len: usize,
}

type ParseOutcome<T> = Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|s| &s.token)
    }

    fn peek_at(&self, distance: usize) -> Option<&Token> {
        self.tokens.get(self.position + distance).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .map_or(self.input_len, |s| s.offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|s| s.token.clone());
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, symbol: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == symbol) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, symbol: &str) -> ParseOutcome<()> {
        if self.eat(symbol) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{symbol}'")))
        }
    }

    fn unexpected(&self, expected: &str) -> String {
        match self.peek() {
            Some(token) => format!(
                "expected {expected} at {}, found {}",
                self.offset(),
                describe(token)
            ),
            None => format!("expected {expected}, found end of expression"),
        }
    }

    fn finish(&self) -> ParseOutcome<()> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.unexpected("end of expression")),
        }
    }

    fn expression(&mut self, min_power: u8) -> ParseOutcome<AstNode> {
        let mut left = self.prefix()?;
        while let Some((power, symbol)) = self.peek().and_then(infix) {
            if power < min_power {
                break;
            }
            self.position += 1;

            if let Some(kind) = TypeOperationKind::from_name(symbol) {
                let target = self.type_specifier()?;
                left = AstNode::type_operation(kind, target, Some(left));
                continue;
            }
            let right = self.expression(power + 1)?;
            left = AstNode::operator(symbol, vec![left, right]);
        }
        Ok(left)
    }

    fn prefix(&mut self) -> ParseOutcome<AstNode> {
        if let Some(Token::Symbol(sign @ ("-" | "+"))) = self.peek() {
            let sign = *sign;
            self.position += 1;
            let operand = self.prefix()?;
            if let NodeKind::Literal {
                value,
                literal_type: literal_type @ (LiteralType::Integer | LiteralType::Decimal),
            } = &operand.kind
            {
                if sign == "-" {
                    return Ok(AstNode::literal(format!("-{value}"), *literal_type));
                }
                return Ok(operand);
            }
            return Ok(AstNode::operator(sign, vec![operand]));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseOutcome<AstNode> {
        let first = self.primary()?;
        let mut steps = match first.kind {
            NodeKind::PathExpression => first.children,
            _ => vec![first],
        };

        loop {
            if self.eat(".") {
                let name = match self.advance() {
                    Some(Token::Identifier(name) | Token::DelimitedIdentifier(name)) => name,
                    _ => {
                        self.position = self.position.saturating_sub(1);
                        return Err(self.unexpected("a member name"));
                    }
                };
                if self.peek() == Some(&Token::Symbol("(")) {
                    let arguments = self.arguments()?;
                    steps.push(AstNode::function(name, arguments));
                } else {
                    steps.push(AstNode::identifier(name));
                }
            } else if self.eat("[") {
                let index = self.expression(0)?;
                self.expect("]")?;
                let base = into_path(std::mem::take(&mut steps));
                steps.push(AstNode::operator("[]", vec![base, index]));
            } else {
                break;
            }
        }
        Ok(into_path(steps))
    }

    fn primary(&mut self) -> ParseOutcome<AstNode> {
        let offset = self.offset();
        let Some(token) = self.advance() else {
            return Err(self.unexpected("an expression"));
        };
        let node = match token {
            Token::Number(digits) => {
                let literal_type = if digits.contains('.') {
                    LiteralType::Decimal
                } else {
                    LiteralType::Integer
                };
                match self.peek() {
                    Some(Token::String(unit)) => {
                        let unit = unit.clone();
                        self.position += 1;
                        AstNode::literal(format!("{digits} '{unit}'"), LiteralType::Quantity)
                    }
                    Some(Token::Identifier(unit)) if CALENDAR_UNITS.contains(&unit.as_str()) => {
                        let unit = unit.clone();
                        self.position += 1;
                        AstNode::literal(format!("{digits} {unit}"), LiteralType::Quantity)
                    }
                    _ => AstNode::literal(digits, literal_type),
                }
            }
            Token::String(value) => AstNode::literal(value, LiteralType::String),
            Token::Temporal(value) => match value.strip_prefix('T') {
                Some(time) => AstNode::literal(time, LiteralType::Time),
                None if value.contains('T') => AstNode::literal(value, LiteralType::DateTime),
                None => AstNode::literal(value, LiteralType::Date),
            },
            Token::Symbol("{") => {
                self.expect("}")?;
                AstNode::literal("", LiteralType::Null)
            }
            Token::Symbol("(") => {
                let inner = self.expression(0)?;
                self.expect(")")?;
                inner
            }
            Token::Identifier(word) if word == "true" || word == "false" => {
                AstNode::literal(word, LiteralType::Boolean)
            }
            Token::Identifier(name) | Token::DelimitedIdentifier(name) => {
                if self.peek() == Some(&Token::Symbol("(")) {
                    let arguments = self.arguments()?;
                    AstNode::function(name, arguments)
                } else {
                    AstNode::identifier(name)
                }
            }
            Token::Variable(name) => AstNode::identifier(name),
            other => {
                return Err(format!(
                    "expected an expression at {offset}, found {}",
                    describe(&other)
                ));
            }
        };
        Ok(node)
    }

    fn arguments(&mut self) -> ParseOutcome<Vec<AstNode>> {
        self.expect("(")?;
        let mut arguments = Vec::new();
        if self.eat(")") {
            return Ok(arguments);
        }
        loop {
            arguments.push(self.expression(0)?);
            if self.eat(")") {
                return Ok(arguments);
            }
            self.expect(",")?;
        }
    }

    /// `Quantity`, `FHIR.Quantity`, `System.String`.
    fn type_specifier(&mut self) -> ParseOutcome<String> {
        let mut parts = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Identifier(name) | Token::DelimitedIdentifier(name)) => {
                    parts.push(name);
                }
                _ => {
                    self.position = self.position.saturating_sub(1);
                    return Err(self.unexpected("a type name"));
                }
            }
            let continues = self.peek() == Some(&Token::Symbol("."))
                && matches!(self.peek_at(1), Some(Token::Identifier(_)));
            if !continues {
                return Ok(parts.join("."));
            }
            self.position += 1;
        }
    }
}

/// Navigation steps as a path; a lone non-navigation node stays as it is.
fn into_path(mut steps: Vec<AstNode>) -> AstNode {
    if steps.len() == 1 {
        let navigates = matches!(
            steps[0].kind,
            NodeKind::Identifier { .. } | NodeKind::FunctionCall { .. }
        );
        if !navigates {
            return steps.remove(0);
        }
    }
    AstNode::path(steps)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Identifier(name) => format!("'{name}'"),
        Token::DelimitedIdentifier(name) => format!("'`{name}`'"),
        Token::Variable(name) => format!("'{name}'"),
        Token::String(value) => format!("string '{value}'"),
        Token::Number(digits) => format!("number {digits}"),
        Token::Temporal(value) => format!("'@{value}'"),
        Token::Symbol(symbol) => format!("'{symbol}'"),
    }
}
