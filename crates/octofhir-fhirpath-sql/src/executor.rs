//! Compilation and execution pipeline.
//!
//! `validate → parse → translate → build → execute`. Every stage is timed.
//! Compiler errors raised inside a stage are returned unchanged; any other
//! failure is wrapped in [`Error::Pipeline`] tagged with the stage and the
//! expression text.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::ast::AstNode;
use crate::config::CompilerConfig;
use crate::context::VariableBinding;
use crate::cte::{Cte, CteAssembler, CteBuilder};
use crate::dialect::SqlDialect;
use crate::fragment::SqlFragment;
use crate::parser::{ExpressionParser, ParseContext};
use crate::translator::Translator;
use crate::{Error, Result};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validate,
    Parse,
    Translate,
    Build,
    Execute,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Parse => "parse",
            Self::Translate => "translate",
            Self::Build => "build",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock duration of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration: Duration,
}

/// Runs SQL produced by the compiler.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute `sql` and return one JSON object per result row.
    async fn execute_query(&self, sql: &str) -> anyhow::Result<Vec<Value>>;
}

/// A compiled expression.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub expression: String,
    pub sql: String,
    pub fragments: Vec<SqlFragment>,
    pub ctes: Vec<Cte>,
    pub timings: Vec<StageTiming>,
}

/// Rows returned for an expression, with the query that produced them.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub query: CompiledQuery,
    pub rows: Vec<Value>,
}

impl ExecutionResult {
    /// Time spent across all stages.
    pub fn total_duration(&self) -> Duration {
        self.query.timings.iter().map(|t| t.duration).sum()
    }
}

/// Drives the compilation pipeline.
pub struct Executor {
    config: CompilerConfig,
    dialect: Arc<dyn SqlDialect>,
    parser: Arc<dyn ExpressionParser>,
    sink: Arc<dyn QueryExecutor>,
    constants: Vec<(String, VariableBinding)>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(
        config: CompilerConfig,
        parser: Arc<dyn ExpressionParser>,
        sink: Arc<dyn QueryExecutor>,
    ) -> Self {
        let dialect = config.dialect();
        Self {
            config,
            dialect,
            parser,
            sink,
            constants: Vec::new(),
        }
    }

    /// Use a dialect other than the configured one.
    #[must_use]
    pub fn with_dialect(mut self, dialect: Arc<dyn SqlDialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Register a `%name` constant for every compiled expression.
    #[must_use]
    pub fn with_constant(mut self, name: impl Into<String>, binding: VariableBinding) -> Self {
        self.constants.push((name.into(), binding));
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Compile `expression` into SQL without running it.
    ///
    /// # Errors
    ///
    /// Returns the compiler error of the failing stage, or
    /// [`Error::Pipeline`] for any other failure.
    #[instrument(skip(self), fields(dialect = self.dialect.name()))]
    pub fn compile(&self, expression: &str) -> Result<CompiledQuery> {
        let mut timings = Vec::with_capacity(5);

        self.run_stage(Stage::Validate, expression, &mut timings, || {
            if expression.trim().is_empty() {
                anyhow::bail!("expression must be a non-empty string");
            }
            self.config.validate()?;
            Ok(())
        })?;

        let ast = self.run_stage(Stage::Parse, expression, &mut timings, || {
            self.parse(expression)
        })?;

        let fragments = self.run_stage(Stage::Translate, expression, &mut timings, || {
            let mut translator = self.translator();
            Ok(translator.translate(&ast)?)
        })?;

        let (ctes, sql) = self.run_stage(Stage::Build, expression, &mut timings, || {
            let builder = CteBuilder::with_dialect(&self.config, Arc::clone(&self.dialect));
            let ctes = builder.build_cte_chain(&fragments)?;
            let sql = CteAssembler::from_config(&self.config).assemble_query(&ctes)?;
            Ok((ctes, sql))
        })?;

        debug!(ctes = ctes.len(), "Compiled expression");
        Ok(CompiledQuery {
            expression: expression.to_string(),
            sql,
            fragments,
            ctes,
            timings,
        })
    }

    /// Compile `expression` and run it through the execution sink.
    ///
    /// # Errors
    ///
    /// As [`Executor::compile`]; sink failures are tagged `execute`.
    #[instrument(skip(self), fields(dialect = self.dialect.name()))]
    pub async fn execute(&self, expression: &str) -> Result<ExecutionResult> {
        let mut query = self.compile(expression)?;

        let started = Instant::now();
        let outcome = self.sink.execute_query(&query.sql).await;
        let duration = started.elapsed();
        query.timings.push(StageTiming {
            stage: Stage::Execute,
            duration,
        });

        match outcome {
            Ok(rows) => {
                debug!(stage = %Stage::Execute, ?duration, rows = rows.len(), "Stage complete");
                Ok(ExecutionResult { query, rows })
            }
            Err(err) => Err(tag(Stage::Execute, expression, err)),
        }
    }

    fn parse(&self, expression: &str) -> anyhow::Result<AstNode> {
        let context = ParseContext {
            resource_type: self.config.resource_type.clone(),
            attach_metadata: true,
        };
        let result = self.parser.parse(expression, &context)?;
        if !result.is_valid() {
            anyhow::bail!("invalid expression: {}", result.errors().join("; "));
        }
        result
            .into_ast()
            .ok_or_else(|| anyhow::anyhow!("parser returned no AST"))
    }

    fn translator(&self) -> Translator {
        self.constants.iter().fold(
            Translator::with_dialect(&self.config, Arc::clone(&self.dialect)),
            |translator, (name, binding)| translator.with_constant(name.clone(), binding.clone()),
        )
    }

    fn run_stage<T>(
        &self,
        stage: Stage,
        expression: &str,
        timings: &mut Vec<StageTiming>,
        run: impl FnOnce() -> anyhow::Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let outcome = run();
        let duration = started.elapsed();
        timings.push(StageTiming { stage, duration });

        match outcome {
            Ok(value) => {
                debug!(stage = %stage, ?duration, "Stage complete");
                Ok(value)
            }
            Err(err) => Err(tag(stage, expression, err)),
        }
    }
}

/// Pass compiler errors through, wrap everything else with the stage.
fn tag(stage: Stage, expression: &str, err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(error) => {
            warn!(stage = %stage, error = %error, "Stage failed");
            error
        }
        Err(other) => {
            warn!(stage = %stage, error = %other, "Stage failed");
            Error::pipeline(stage, expression, other)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FhirPathParser, ParseResult};
    use tokio_test::block_on;

    struct NoRows;

    #[async_trait]
    impl QueryExecutor for NoRows {
        async fn execute_query(&self, _sql: &str) -> anyhow::Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    struct BrokenParser;

    impl ExpressionParser for BrokenParser {
        fn parse(&self, _expression: &str, _context: &ParseContext) -> anyhow::Result<ParseResult> {
            anyhow::bail!("parser crashed")
        }
    }

    fn executor() -> Executor {
        Executor::new(
            CompilerConfig::default(),
            Arc::new(FhirPathParser::new()),
            Arc::new(NoRows),
        )
    }

    #[test]
    fn test_stage_names() {
        let names: Vec<_> = [
            Stage::Validate,
            Stage::Parse,
            Stage::Translate,
            Stage::Build,
            Stage::Execute,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(names, ["validate", "parse", "translate", "build", "execute"]);
    }

    #[test]
    fn test_compile_times_every_stage() {
        let compiled = executor().compile("name.given").unwrap();
        let stages: Vec<_> = compiled.timings.iter().map(|t| t.stage).collect();
        assert_eq!(
            stages,
            [Stage::Validate, Stage::Parse, Stage::Translate, Stage::Build]
        );
        assert_eq!(compiled.ctes.len(), 1);
    }

    #[test]
    fn test_blank_expression_fails_validation() {
        let err = executor().compile("   ").unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Validate));
        assert!(err.to_string().contains("'   '"));
    }

    #[test]
    fn test_parser_failure_is_tagged() {
        let executor = Executor::new(
            CompilerConfig::default(),
            Arc::new(BrokenParser),
            Arc::new(NoRows),
        );
        let err = executor.compile("name").unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Parse));
        assert!(err.to_string().contains("parser crashed"));
    }

    #[test]
    fn test_compiler_errors_pass_through() {
        let err = executor().compile("name.frobnicate()").unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(ref name) if name == "frobnicate"));
        assert_eq!(err.stage(), None);
    }

    #[test]
    fn test_execute_adds_execute_timing() {
        let result = block_on(executor().execute("name")).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.query.timings.len(), 5);
        assert_eq!(result.query.timings[4].stage, Stage::Execute);
    }
}
