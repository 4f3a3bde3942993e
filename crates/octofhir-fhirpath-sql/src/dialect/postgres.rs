//! PostgreSQL dialect over JSONB resources.

use super::{
    MathFunction, SqlDataType, SqlDialect, StringFunction, ansi_math_function,
    ansi_string_function, quote_literal,
};

const INTEGER_PATTERN: &str = "^[+-]?[0-9]+$";
const DECIMAL_PATTERN: &str = "^[+-]?([0-9]+(\\.[0-9]*)?|\\.[0-9]+)([eE][+-]?[0-9]+)?$";
const DATE_PATTERN: &str = "^[0-9]{4}-[0-9]{2}-[0-9]{2}$";
const TIMESTAMP_PATTERN: &str = "^[0-9]{4}-[0-9]{2}-[0-9]{2}([T ][0-9]{2}:[0-9]{2}(:[0-9]{2}(\\.[0-9]+)?)?)?";
const TIME_PATTERN: &str = "^[0-9]{2}:[0-9]{2}(:[0-9]{2}(\\.[0-9]+)?)?$";

/// PostgreSQL dialect using the `->`/`->>` JSONB operators.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    fn regex_guarded_cast(&self, expr: &str, pattern: &str, sql_type: SqlDataType) -> String {
        format!(
            "(CASE WHEN ({expr}) ~ '{pattern}' THEN CAST({expr} AS {}) END)",
            self.type_name(sql_type)
        )
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn extract_json_object(&self, base: &str, path: &[String]) -> String {
        let mut sql = base.to_string();
        for field in path {
            sql = format!("{sql}->{}", quote_literal(field));
        }
        sql
    }

    fn extract_json_text(&self, base: &str, path: &[String]) -> String {
        match path.split_last() {
            Some((last, parents)) => format!(
                "{}->>{}",
                self.extract_json_object(base, parents),
                quote_literal(last)
            ),
            None => self.json_to_text(base),
        }
    }

    fn json_array_element(&self, array: &str, index: usize) -> String {
        format!("({array} -> {index})")
    }

    fn json_to_text(&self, expr: &str) -> String {
        format!("({expr} #>> '{{}}')")
    }

    fn to_json(&self, expr: &str) -> String {
        format!("to_jsonb({expr})")
    }

    fn json_exists(&self, expr: &str) -> String {
        format!("({expr} IS NOT NULL AND {expr} <> 'null'::jsonb AND {expr} <> '[]'::jsonb)")
    }

    fn json_array(&self, expr: &str) -> String {
        format!(
            "(CASE WHEN {expr} IS NULL OR {expr} = 'null'::jsonb THEN '[]'::jsonb \
             WHEN jsonb_typeof({expr}) = 'array' THEN {expr} \
             ELSE jsonb_build_array({expr}) END)"
        )
    }

    fn array_length(&self, expr: &str) -> String {
        format!("jsonb_array_length({})", self.json_array(expr))
    }

    fn unnest_source(&self, array_expr: &str, alias: &str) -> String {
        format!(
            "jsonb_array_elements({}) WITH ORDINALITY AS {alias}(value, ordinality)",
            self.json_array(array_expr)
        )
    }

    fn aggregate_json_array(&self, value: &str, order_by: &str) -> String {
        format!("jsonb_agg({value} ORDER BY {order_by})")
    }

    fn aggregate_distinct_json_array(&self, value: &str) -> String {
        format!("jsonb_agg(DISTINCT {value})")
    }

    fn empty_json_array(&self) -> String {
        "'[]'::jsonb".to_string()
    }

    fn split_to_json_array(&self, text: &str, separator: &str) -> String {
        if separator == "''" {
            format!("to_jsonb(regexp_split_to_array({text}, ''))")
        } else {
            format!("to_jsonb(string_to_array({text}, {separator}))")
        }
    }

    fn type_name(&self, sql_type: SqlDataType) -> &'static str {
        match sql_type {
            SqlDataType::Text => "TEXT",
            SqlDataType::Integer => "BIGINT",
            SqlDataType::Decimal => "NUMERIC",
            SqlDataType::Boolean => "BOOLEAN",
            SqlDataType::Date => "DATE",
            SqlDataType::Timestamp => "TIMESTAMP",
            SqlDataType::Time => "TIME",
            SqlDataType::Json => "JSONB",
        }
    }

    fn safe_cast(&self, expr: &str, sql_type: SqlDataType) -> String {
        match sql_type {
            SqlDataType::Integer => self.regex_guarded_cast(expr, INTEGER_PATTERN, sql_type),
            SqlDataType::Decimal => self.regex_guarded_cast(expr, DECIMAL_PATTERN, sql_type),
            SqlDataType::Date => self.regex_guarded_cast(expr, DATE_PATTERN, sql_type),
            SqlDataType::Timestamp => self.regex_guarded_cast(expr, TIMESTAMP_PATTERN, sql_type),
            SqlDataType::Time => self.regex_guarded_cast(expr, TIME_PATTERN, sql_type),
            SqlDataType::Boolean => format!(
                "(CASE WHEN LOWER({expr}) IN ('true', 't', '1') THEN TRUE \
                 WHEN LOWER({expr}) IN ('false', 'f', '0') THEN FALSE END)"
            ),
            SqlDataType::Text => format!("CAST({expr} AS TEXT)"),
            SqlDataType::Json => self.to_json(expr),
        }
    }

    fn integer_division(&self, left: &str, right: &str) -> String {
        format!("CAST(TRUNC(CAST({left} AS NUMERIC) / {right}) AS BIGINT)")
    }

    fn regex_match(&self, expr: &str, pattern: &str) -> String {
        format!("({expr} ~ {pattern})")
    }

    fn string_function(&self, function: StringFunction, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("NULL");
        match function {
            StringFunction::StartsWith => format!("starts_with({}, {})", arg(0), arg(1)),
            _ => ansi_string_function(function, args),
        }
    }

    fn math_function(&self, function: MathFunction, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("NULL");
        match function {
            // ROUND(x, n) only exists for NUMERIC.
            MathFunction::Round => match args.get(1) {
                Some(precision) => format!("ROUND(CAST({} AS NUMERIC), {precision})", arg(0)),
                None => format!("ROUND({})", arg(0)),
            },
            MathFunction::Log => format!(
                "LOG(CAST({} AS NUMERIC), CAST({} AS NUMERIC))",
                arg(1),
                arg(0)
            ),
            _ => ansi_math_function(function, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_extract_json_paths() {
        let dialect = PostgresDialect::new();
        assert_eq!(
            dialect.extract_json_object("resource", &path(&["name", "given"])),
            "resource->'name'->'given'"
        );
        assert_eq!(
            dialect.extract_json_text("resource", &path(&["name", "family"])),
            "resource->'name'->>'family'"
        );
        assert_eq!(dialect.extract_json_object("result", &[]), "result");
    }

    #[test]
    fn test_flatten_unwraps_every_level() {
        let dialect = PostgresDialect::new();
        let sql = dialect.flatten_json_path("src.resource", &path(&["name", "given"]), true);
        assert!(sql.starts_with(
            "(SELECT CASE COUNT(*) WHEN 0 THEN NULL \
             WHEN 1 THEN (jsonb_agg(nav2.value ORDER BY nav1.ordinality, nav2.ordinality) -> 0) \
             ELSE jsonb_agg(nav2.value ORDER BY nav1.ordinality, nav2.ordinality) END \
             FROM jsonb_array_elements("
        ));
        assert!(sql.contains("WHEN jsonb_typeof(src.resource->'name') = 'array'"));
        assert!(sql.contains(") WITH ORDINALITY AS nav1(value, ordinality) CROSS JOIN LATERAL"));
        assert!(sql.contains("WHEN jsonb_typeof(nav1.value->'given') = 'array'"));
        assert!(sql.ends_with("WITH ORDINALITY AS nav2(value, ordinality))"));
    }

    #[test]
    fn test_flatten_unwraps_collection_base() {
        let dialect = PostgresDialect::new();
        let sql = dialect.flatten_json_path("src.result", &path(&["family"]), false);
        assert!(sql.contains("WHEN jsonb_typeof(src.result) = 'array'"));
        assert!(sql.contains("AS nav0(value, ordinality)"));
        assert!(sql.contains("nav0.value->'family'"));
        assert!(sql.contains("ORDER BY nav0.ordinality, nav1.ordinality"));
    }

    #[test]
    fn test_unnest_uses_ordinality() {
        let dialect = PostgresDialect::new();
        let sql = dialect.lateral_unnest("resource->'name'", "elem");
        assert!(sql.starts_with("CROSS JOIN LATERAL jsonb_array_elements("));
        assert!(sql.ends_with("WITH ORDINALITY AS elem(value, ordinality)"));
    }

    #[test]
    fn test_safe_cast_is_regex_guarded() {
        let dialect = PostgresDialect::new();
        let sql = dialect.safe_cast("x", SqlDataType::Integer);
        assert_eq!(sql, "(CASE WHEN (x) ~ '^[+-]?[0-9]+$' THEN CAST(x AS BIGINT) END)");
    }

    #[test]
    fn test_split_characters() {
        let dialect = PostgresDialect::new();
        assert_eq!(
            dialect.split_to_json_array("t", "''"),
            "to_jsonb(regexp_split_to_array(t, ''))"
        );
        assert_eq!(
            dialect.split_to_json_array("t", "','"),
            "to_jsonb(string_to_array(t, ','))"
        );
    }
}
