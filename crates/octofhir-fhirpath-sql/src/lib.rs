//! Population-scale FHIRPath to SQL compiler for OctoFHIR.
//!
//! This crate compiles FHIRPath expressions into a single SQL statement that
//! runs over a whole table of JSON resources at once, instead of evaluating
//! the expression resource by resource.
//!
//! # Overview
//!
//! The compiler is a small pipeline:
//!
//! 1. A parser turns expression text into an [`AstNode`] tree.
//! 2. The [`Translator`] walks the tree and emits an ordered list of
//!    [`SqlFragment`]s. Only collection operations on the main navigation
//!    chain become fragments; paths, literals and operators are folded into
//!    the expression of the enclosing fragment.
//! 3. The [`CteBuilder`] wraps every fragment into a named CTE and the
//!    [`CteAssembler`] orders them by dependency into one `WITH ... SELECT`.
//! 4. The [`Executor`] drives all stages, times them and tags failures with
//!    the stage that produced them.
//!
//! All database specific syntax goes through the [`SqlDialect`] trait.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use octofhir_fhirpath_sql::{CompilerConfig, Executor, FhirPathParser};
//!
//! let config = CompilerConfig::default().with_resource_type("Patient");
//! let executor = Executor::new(config, Arc::new(FhirPathParser::new()), sink);
//!
//! let compiled = executor.compile("Patient.name.where(use = 'official').first()")?;
//! println!("{}", compiled.sql);
//!
//! let result = executor.execute("Patient.name.given").await?;
//! ```

pub mod ast;
pub mod config;
mod context;
pub mod cte;
pub mod dialect;
mod executor;
mod fragment;
pub mod parser;
mod runner;
mod translator;

pub use ast::{
    Arity, AstNode, LiteralType, NodeCategory, NodeKind, NodeMetadata, OptimizationHint,
    SqlDataType, TypeOperationKind,
};
pub use config::CompilerConfig;
pub use context::{TranslationContext, ValueType, VariableBinding};
pub use cte::{Cte, CteAssembler, CteBuilder};
pub use dialect::{DialectKind, DuckDbDialect, PostgresDialect, SqlDialect};
pub use executor::{CompiledQuery, ExecutionResult, Executor, QueryExecutor, Stage, StageTiming};
pub use fragment::SqlFragment;
pub use parser::{ExpressionParser, FhirPathParser, ParseContext, ParseResult};
pub use runner::PgQueryExecutor;
pub use translator::{ScopedTranslator, Translator};

use thiserror::Error;

/// Errors that can occur while compiling or executing a FHIRPath expression.
#[derive(Debug, Error)]
pub enum Error {
    /// A fragment was constructed with invalid inputs.
    #[error("Invalid SQL fragment: {0}")]
    InvalidFragment(String),

    /// A CTE was constructed with invalid inputs.
    #[error("Invalid CTE: {0}")]
    InvalidCte(String),

    /// The AST produced no SQL fragments.
    #[error("Translation produced no SQL fragments")]
    EmptyTranslation,

    /// A literal of this type has no SQL rendering.
    #[error("Unsupported literal type: {0}")]
    UnsupportedLiteralType(String),

    /// A literal could not be parsed into a value of its type.
    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),

    /// A `$` or `%` variable was referenced outside of any binding.
    #[error("Unbound variable: {0}")]
    UnboundVariable(String),

    /// An operator node has the wrong number of operands.
    #[error("Operator '{operator}' expects {expected} operand(s), got {actual}")]
    InvalidOperatorArity {
        operator: String,
        expected: usize,
        actual: usize,
    },

    /// The operator symbol is not known to the translator.
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// The function name is not known to the translator.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A function was called with the wrong number of arguments.
    #[error("Function '{function}' expects {expected} argument(s), got {actual}")]
    InvalidArgumentCount {
        function: String,
        expected: String,
        actual: usize,
    },

    /// A path or argument cannot be converted to SQL.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// No CTEs were produced or supplied.
    #[error("CTE chain is empty")]
    EmptyCteChain,

    /// An unnesting fragment did not carry its array expression.
    #[error("Fragment for {cte} requires unnesting but has no 'array_column' metadata")]
    MissingArrayColumnMetadata { cte: String },

    /// CTEs reference names that are neither CTEs nor external tables.
    #[error("Missing CTE dependencies: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    /// CTE dependencies form a cycle.
    #[error("Circular CTE dependencies: {}", .0.join(", "))]
    CircularDependency(Vec<String>),

    /// A pipeline stage failed with an error that is not a compiler error.
    #[error("Stage '{stage}' failed for expression '{expression}': {source}")]
    Pipeline {
        stage: Stage,
        expression: String,
        #[source]
        source: anyhow::Error,
    },

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error occurred while executing SQL.
    #[error("SQL execution error: {0}")]
    Sql(#[from] sqlx_core::error::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a new InvalidArgumentCount error.
    pub fn invalid_argument_count(
        function: impl Into<String>,
        expected: impl Into<String>,
        actual: usize,
    ) -> Self {
        Self::InvalidArgumentCount {
            function: function.into(),
            expected: expected.into(),
            actual,
        }
    }

    /// Create a new Pipeline error.
    pub fn pipeline(stage: Stage, expression: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Pipeline {
            stage,
            expression: expression.into(),
            source,
        }
    }

    /// The pipeline stage of a stage-tagged error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Pipeline { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Check if this error was raised while translating the AST.
    pub fn is_translation_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyTranslation
                | Self::UnsupportedLiteralType(_)
                | Self::InvalidLiteral(_)
                | Self::UnboundVariable(_)
                | Self::InvalidOperatorArity { .. }
                | Self::UnknownOperator(_)
                | Self::UnknownFunction(_)
                | Self::InvalidArgumentCount { .. }
                | Self::InvalidPath(_)
        )
    }

    /// Check if this error was raised while building or assembling CTEs.
    pub fn is_assembly_error(&self) -> bool {
        matches!(
            self,
            Self::EmptyCteChain
                | Self::MissingArrayColumnMetadata { .. }
                | Self::MissingDependencies(_)
                | Self::CircularDependency(_)
        )
    }
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;
