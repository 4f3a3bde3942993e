//! End-to-end tests for the FHIRPath to SQL compiler.
//!
//! These tests drive the public pipeline without a database: SQL is
//! captured by a recording sink instead of being executed.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use octofhir_fhirpath_sql::{
    AstNode, CompilerConfig, Cte, CteAssembler, CteBuilder, DialectKind, Error, Executor,
    ExpressionParser, FhirPathParser, LiteralType, ParseContext, PostgresDialect, QueryExecutor,
    Stage, Translator, ValueType, VariableBinding,
};
use serde_json::{Value, json};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct RecordingSink {
    statements: Mutex<Vec<String>>,
    rows: Vec<Value>,
}

#[async_trait]
impl QueryExecutor for RecordingSink {
    async fn execute_query(&self, sql: &str) -> anyhow::Result<Vec<Value>> {
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(self.rows.clone())
    }
}

struct FailingSink;

#[async_trait]
impl QueryExecutor for FailingSink {
    async fn execute_query(&self, _sql: &str) -> anyhow::Result<Vec<Value>> {
        anyhow::bail!("connection refused")
    }
}

fn patient_config() -> CompilerConfig {
    CompilerConfig::default().with_resource_type("Patient")
}

fn executor(config: CompilerConfig) -> Executor {
    Executor::new(
        config,
        Arc::new(FhirPathParser::new()),
        Arc::new(RecordingSink::default()),
    )
}

fn parse(expression: &str) -> AstNode {
    FhirPathParser::new()
        .parse(expression, &ParseContext::new())
        .unwrap()
        .into_ast()
        .unwrap()
}

fn translator() -> Translator {
    Translator::new(Arc::new(PostgresDialect::new()))
}

fn cte(name: &str, depends_on: &[&str]) -> Cte {
    Cte::new(name, format!("SELECT id, result FROM {name}_source"))
        .unwrap()
        .with_dependencies(depends_on.iter().copied())
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_simple_path_compiles_to_single_cte() {
    let compiled = executor(patient_config()).compile("Patient.name").unwrap();

    assert_eq!(compiled.ctes.len(), 1);
    assert!(compiled.ctes[0].depends_on.is_empty());
    assert!(compiled.ctes[0].query.contains("src.resource->'name' AS result"));
    assert!(compiled.ctes[0].query.contains("FROM resource AS src"));
    assert!(!compiled.sql.starts_with("WITH"));
    assert!(compiled.sql.starts_with("SELECT id, result FROM (\n"));
    assert!(compiled.sql.ends_with("\n) AS cte_1"));
}

#[test]
fn test_result_columns_do_not_depend_on_chain_length() {
    let executor = executor(patient_config());
    let projection = |sql: &str| {
        let select = sql.rfind("SELECT id, ").unwrap();
        sql[select..].split(" FROM ").next().unwrap().to_string()
    };

    let simple = executor.compile("Patient.name").unwrap();
    let chained = executor
        .compile("Patient.name.where(use = 'official').empty()")
        .unwrap();
    assert_eq!(simple.ctes.len(), 1);
    assert!(chained.ctes.len() > 1);
    assert_eq!(projection(&simple.sql), "SELECT id, result");
    assert_eq!(projection(&chained.sql), "SELECT id, result");
}

#[test]
fn test_where_then_first_chains_back_to_root() {
    let compiled = executor(patient_config())
        .compile("Patient.name.where(use = 'official').first()")
        .unwrap();
    let ctes = &compiled.ctes;

    assert!(ctes.len() >= 2);

    let filter = ctes
        .iter()
        .find(|cte| cte.requires_unnest && cte.query.contains("WHERE"))
        .expect("a filtering CTE");
    assert!(!filter.query.contains("$this"));
    assert!(!filter.query.contains("$total"));
    assert!(filter.query.contains("'official'"));

    // Walk the dependency chain from the terminal CTE to the resource table.
    let mut current = ctes.last().unwrap();
    let mut hops = 0;
    while let Some(dependency) = current.depends_on.first() {
        current = ctes.iter().find(|cte| &cte.name == dependency).unwrap();
        hops += 1;
    }
    assert_eq!(hops, ctes.len() - 1);
    assert!(current.query.contains("FROM resource AS src"));

    assert!(compiled.sql.starts_with("WITH cte_1 AS (\n"));
    assert!(compiled.sql.ends_with(&format!("SELECT id, result FROM {}", ctes.last().unwrap().name)));
}

#[test]
fn test_division_by_zero_yields_null() {
    let compiled = executor(CompilerConfig::default()).compile("5 / 0").unwrap();

    assert_eq!(compiled.fragments.len(), 1);
    assert_eq!(compiled.fragments[0].expression(), "CAST(NULL AS NUMERIC)");
    assert!(!compiled.sql.contains("/ 0"));
}

#[test]
fn test_unknown_dependency_is_named() {
    let ctes = vec![cte("cte_1", &[]), cte("cte_2", &["unknown_table"])];
    let err = CteAssembler::new().assemble_query(&ctes).unwrap_err();

    assert!(matches!(err, Error::MissingDependencies(ref names) if names == &["unknown_table"]));
    assert!(err.to_string().contains("unknown_table"));
}

// =============================================================================
// Determinism and scoping
// =============================================================================

#[test]
fn test_compilation_is_deterministic() {
    let executor = executor(patient_config());
    let expression = "Patient.name.where(use = 'official' and given.exists()).select(family).count()";

    let first = executor.compile(expression).unwrap();
    let second = executor.compile(expression).unwrap();
    assert_eq!(first.sql, second.sql);
    assert_eq!(first.ctes, second.ctes);
}

#[test]
fn test_scope_is_restored_after_failed_lambda() {
    let mut translator = translator();
    let before = translator.context().visible_bindings();

    let err = translator
        .translate(&parse("name.where(%undefined = 'x')"))
        .unwrap_err();
    assert!(matches!(err, Error::UnboundVariable(ref name) if name == "%undefined"));

    assert_eq!(translator.context().scope_depth(), 1);
    assert!(translator.context().resolve_variable("$this").is_none());
    assert_eq!(translator.context().visible_bindings(), before);

    // The translator stays usable.
    let fragments = translator.translate(&parse("name.given")).unwrap();
    assert_eq!(fragments.len(), 1);
}

#[test]
fn test_lambda_variables_are_substituted() {
    let fragments = translator()
        .translate(&parse("telecom.where($this.system = 'phone' and $index < $total)"))
        .unwrap();
    let filter = fragments[0]
        .metadata_str("filter_condition")
        .expect("filter condition");

    assert!(filter.contains("elem.value"));
    assert!(filter.contains("elem.ordinality"));
    assert!(!filter.contains("$this"));
    assert!(!filter.contains("$index"));
    assert!(!filter.contains("$total"));
}

#[test]
fn test_constants_are_visible_to_every_expression() {
    let executor = executor(CompilerConfig::default()).with_constant(
        "system",
        VariableBinding::new("'http://loinc.org'", ValueType::String),
    );
    let compiled = executor
        .compile("code.coding.where(system = %system).code")
        .unwrap();
    assert!(compiled.sql.contains("'http://loinc.org'"));
}

// =============================================================================
// Operators
// =============================================================================

#[test]
fn test_runtime_division_is_guarded() {
    let compiled = executor(CompilerConfig::default())
        .compile("valueInteger / divisor")
        .unwrap();
    assert!(compiled.fragments[0].expression().contains("NULLIF("));
}

#[test]
fn test_runtime_modulo_is_guarded() {
    let compiled = executor(CompilerConfig::default())
        .compile("valueInteger mod divisor")
        .unwrap();
    let sql = compiled.fragments[0].expression();

    assert!(sql.contains(" % NULLIF("));
    assert!(sql.contains("src.resource->>'divisor'"));
    assert!(sql.ends_with(", 0))"));
    assert_eq!(compiled.fragments[0].metadata_str("result_type"), Some("decimal"));
}

#[test]
fn test_literal_modulo_by_zero_is_null() {
    let compiled = executor(CompilerConfig::default()).compile("7 mod 0").unwrap();
    assert_eq!(compiled.fragments[0].expression(), "CAST(NULL AS BIGINT)");
}

#[test]
fn test_temporal_comparison_depends_on_precision() {
    let executor = executor(CompilerConfig::default());

    let direct = executor.compile("@2018-03-01 < @2018-03-02").unwrap();
    assert_eq!(
        direct.fragments[0].expression(),
        "(DATE '2018-03-01' < DATE '2018-03-02')"
    );

    let ranged = executor.compile("@2018-03 < @2018-03-01").unwrap();
    let sql = ranged.fragments[0].expression();
    assert!(sql.starts_with("(CASE WHEN "));
    assert!(sql.ends_with("ELSE NULL END)"));
}

#[test]
fn test_literal_fragment_records_type() {
    let compiled = executor(CompilerConfig::default()).compile("'official'").unwrap();
    assert_eq!(
        compiled.fragments[0].metadata_str("literal_type"),
        Some("string")
    );
    assert_eq!(compiled.fragments[0].metadata(), &compiled.ctes[0].metadata);
}

// =============================================================================
// Functions
// =============================================================================

#[test]
fn test_tail_matches_skip_one() {
    let executor = executor(CompilerConfig::default());
    let tail = executor.compile("name.tail()").unwrap();
    let skip = executor.compile("name.skip(1)").unwrap();

    assert_eq!(tail.sql, skip.sql);
}

#[test]
fn test_last_orders_descending() {
    let compiled = executor(CompilerConfig::default())
        .compile("name.last()")
        .unwrap();
    let sql = compiled.fragments.last().unwrap().expression();
    assert!(sql.contains("DESC"));
    assert!(sql.contains("LIMIT 1"));
}

#[test]
fn test_aggregate_over_filtered_rows_groups_by_document() {
    let compiled = executor(CompilerConfig::default())
        .compile("name.where(use = 'official').count()")
        .unwrap();
    let last = compiled.ctes.last().unwrap();

    assert!(last.query.contains("GROUP BY"));
    assert_eq!(
        compiled.fragments.last().unwrap().metadata_str("function"),
        Some("count")
    );
}

#[test]
fn test_unknown_function_and_arity() {
    let executor = executor(CompilerConfig::default());

    let err = executor.compile("name.shout()").unwrap_err();
    assert!(matches!(err, Error::UnknownFunction(ref name) if name == "shout"));
    assert!(err.is_translation_error());

    let err = executor.compile("name.substring()").unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgumentCount { ref function, actual: 0, .. } if function == "substring"
    ));
}

// =============================================================================
// Collections across documents
// =============================================================================

#[test]
fn test_navigation_flattens_array_fields() {
    let executor = executor(patient_config());

    for (expression, outer, inner) in [
        ("Patient.name.family", "name", "family"),
        ("Patient.identifier.value", "identifier", "value"),
        ("Patient.telecom.value", "telecom", "value"),
    ] {
        let compiled = executor.compile(expression).unwrap();
        let sql = compiled.fragments[0].expression();

        assert_eq!(compiled.ctes.len(), 1, "{expression}");
        assert!(
            sql.contains(&format!("jsonb_typeof(src.resource->'{outer}') = 'array'")),
            "{expression}: {sql}"
        );
        assert!(sql.contains(&format!("nav1.value->'{inner}'")), "{expression}: {sql}");
        assert!(!sql.contains(&format!("->'{outer}'->'{inner}'")), "{expression}: {sql}");
    }
}

#[test]
fn test_first_given_name_reads_flattened_names() {
    let compiled = executor(patient_config())
        .compile("Patient.name.given.first()")
        .unwrap();
    let sql = compiled.fragments[0].expression();

    assert_eq!(compiled.fragments.len(), 1);
    assert!(sql.contains("ORDER BY nav1.ordinality, nav2.ordinality"));
    assert!(sql.contains("nav1.value->'given'"));
    assert!(sql.contains("ORDER BY e1.ordinality ASC LIMIT 1"));
}

#[test]
fn test_filtered_out_documents_keep_a_row() {
    let executor = executor(patient_config());
    let rejoin = "FROM resource AS doc\nLEFT JOIN cte_1 AS src ON src.id = doc.id\nLEFT JOIN LATERAL";

    let count = executor
        .compile("Patient.name.where(use = 'official').count()")
        .unwrap();
    let last = count.ctes.last().unwrap();
    assert_eq!(count.ctes.len(), 2);
    assert!(last.query.contains("COUNT(elem.value) AS result"));
    assert!(last.query.contains(rejoin));
    assert!(last.query.ends_with("GROUP BY doc.id, doc.resource"));

    for expression in [
        "Patient.name.where(use = 'official').empty()",
        "Patient.name.where(use = 'official').exists()",
        "Patient.name.where(use = 'official').exists().not()",
        "Patient.name.where(use = 'official')",
    ] {
        let compiled = executor.compile(expression).unwrap();
        let collect = &compiled.ctes[1];
        assert_eq!(collect.metadata.get("function"), Some(&json!("collect")), "{expression}");
        assert!(collect.query.contains(rejoin), "{expression}");
        assert!(collect.query.contains("FILTER (WHERE elem.value IS NOT NULL)"), "{expression}");
        for later in &compiled.ctes[2..] {
            assert!(!later.requires_unnest, "{expression}");
            assert!(!later.query.contains("WHERE"), "{expression}");
        }
    }
}

#[test]
fn test_regrouping_after_a_document_level_cte() {
    let compiled = executor(patient_config())
        .compile("Patient.name.distinct().where(use = 'official').count()")
        .unwrap();
    let ctes = &compiled.ctes;

    assert_eq!(ctes.len(), 3);
    assert!(ctes[2].query.contains("FROM cte_1 AS doc\nLEFT JOIN cte_2 AS src"));
    assert_eq!(ctes[2].depends_on, vec!["cte_2", "cte_1"]);
    assert!(compiled.sql.ends_with("SELECT id, result FROM cte_3"));
}

// =============================================================================
// CTE assembly
// =============================================================================

#[test]
fn test_assembly_orders_by_dependency_and_input_position() {
    let ctes = vec![
        cte("c", &["b"]),
        cte("a", &["resource"]),
        cte("b", &["a"]),
        cte("d", &["resource"]),
    ];
    let sql = CteAssembler::new().assemble_query(&ctes).unwrap();

    // Ready CTEs are taken in input order, so `d` waits behind the chain.
    let position = |name: &str| sql.find(&format!("{name} AS (")).unwrap();
    assert!(position("a") < position("b"));
    assert!(position("b") < position("c"));
    assert!(position("c") < position("d"));
    assert!(sql.ends_with("SELECT id, result FROM d"));
}

#[test]
fn test_assembly_rejects_cycles() {
    let ctes = vec![cte("a", &["b"]), cte("b", &["a"]), cte("c", &[])];
    let err = CteAssembler::new().assemble_query(&ctes).unwrap_err();

    assert!(matches!(err, Error::CircularDependency(ref names) if names == &["a", "b"]));
    assert!(err.is_assembly_error());
}

#[test]
fn test_configured_external_tables_are_accepted() {
    let config = CompilerConfig::default().with_external_table("terminology");
    let ctes = vec![cte("a", &["terminology"]), cte("b", &["a"])];
    assert!(CteAssembler::from_config(&config).assemble_query(&ctes).is_ok());
}

#[test]
fn test_builder_reads_from_configured_table() {
    let config = CompilerConfig::default()
        .with_resource_table("patient")
        .with_resource_column("content");
    let fragments = Translator::from_config(&config)
        .translate(&parse("name.where(use = 'official')"))
        .unwrap();
    let ctes = CteBuilder::from_config(&config)
        .build_cte_chain(&fragments)
        .unwrap();

    assert!(ctes[0].query.contains("FROM patient AS src"));
    assert!(ctes[0].query.contains("src.content->'name'"));
    assert_eq!(ctes.last().unwrap().depends_on, vec![ctes[0].name.clone()]);
}

// =============================================================================
// Pipeline
// =============================================================================

#[test]
fn test_invalid_syntax_is_tagged_parse() {
    let err = executor(CompilerConfig::default())
        .compile("name.where(")
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Parse));
    assert!(err.to_string().contains("name.where("));
}

#[test]
fn test_resource_type_mismatch_is_rejected() {
    let err = executor(patient_config())
        .compile("Observation.status")
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Parse));
}

#[tokio::test]
async fn test_execute_sends_assembled_sql_to_sink() {
    let sink = Arc::new(RecordingSink {
        statements: Mutex::new(Vec::new()),
        rows: vec![json!({"id": "pt-1", "result": [{"family": "Chalmers"}]})],
    });
    let executor = Executor::new(
        patient_config(),
        Arc::new(FhirPathParser::new()),
        Arc::clone(&sink) as Arc<dyn QueryExecutor>,
    );

    let result = executor.execute("Patient.name").await.unwrap();

    assert_eq!(result.rows, vec![json!({"id": "pt-1", "result": [{"family": "Chalmers"}]})]);
    assert_eq!(*sink.statements.lock().unwrap(), vec![result.query.sql.clone()]);
    let stages: Vec<_> = result.query.timings.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        [Stage::Validate, Stage::Parse, Stage::Translate, Stage::Build, Stage::Execute]
    );
}

#[tokio::test]
async fn test_sink_failure_is_tagged_execute() {
    let executor = Executor::new(
        CompilerConfig::default(),
        Arc::new(FhirPathParser::new()),
        Arc::new(FailingSink),
    );
    let err = executor.execute("name").await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Execute));
    let message = err.to_string();
    assert!(message.contains("'execute'"));
    assert!(message.contains("connection refused"));
}

// =============================================================================
// Parser and dialects
// =============================================================================

#[test]
fn test_parser_builds_literals_and_paths() {
    let ast = parse("Patient.birthDate >= @1990-01-01");
    assert_eq!(ast.children.len(), 2);
    assert_eq!(ast.children[1], AstNode::literal("1990-01-01", LiteralType::Date));
    assert_eq!(
        ast.children[0],
        AstNode::path(vec![
            AstNode::identifier("Patient"),
            AstNode::identifier("birthDate"),
        ])
    );
}

#[test]
fn test_duckdb_dialect_uses_json_functions() {
    let config = CompilerConfig::default().with_dialect(DialectKind::DuckDb);
    let compiled = executor(config).compile("name.family").unwrap();

    assert!(compiled.sql.contains("json_extract(src.resource, '$.name')"));
    assert!(compiled.sql.contains("json_extract(nav1.value, '$.family')"));
    assert!(!compiled.sql.contains("$.name.family"));
    assert!(!compiled.sql.contains("->"));
}

#[test]
fn test_config_from_toml_drives_compilation() {
    let config = CompilerConfig::from_toml_str(
        r#"
            resource_table = "observation"
            resource_type = "Observation"
        "#,
    )
    .unwrap();
    let compiled = executor(config).compile("Observation.status").unwrap();
    assert!(compiled.sql.contains("FROM observation AS src"));
}
