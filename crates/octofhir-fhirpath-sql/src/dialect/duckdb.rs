//! DuckDB dialect over the JSON extension.

use super::{
    MathFunction, SqlDataType, SqlDialect, StringFunction, ansi_math_function,
    ansi_string_function,
};

/// DuckDB dialect using `json_extract` with `$.a.b` paths.
#[derive(Debug, Clone, Default)]
pub struct DuckDbDialect;

impl DuckDbDialect {
    pub fn new() -> Self {
        Self
    }

    /// Build a JSON path such as `$.name.given`.
    fn json_path(path: &[String]) -> String {
        let mut json_path = String::from("$");
        for field in path {
            if field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                json_path.push('.');
                json_path.push_str(field);
            } else {
                json_path.push_str(&format!(".\"{}\"", field.replace('"', "\\\"")));
            }
        }
        json_path.replace('\'', "''")
    }
}

impl SqlDialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn extract_json_object(&self, base: &str, path: &[String]) -> String {
        if path.is_empty() {
            return base.to_string();
        }
        format!("json_extract({base}, '{}')", Self::json_path(path))
    }

    fn extract_json_text(&self, base: &str, path: &[String]) -> String {
        if path.is_empty() {
            return self.json_to_text(base);
        }
        format!("json_extract_string({base}, '{}')", Self::json_path(path))
    }

    fn json_array_element(&self, array: &str, index: usize) -> String {
        format!("json_extract({array}, '$[{index}]')")
    }

    fn json_to_text(&self, expr: &str) -> String {
        format!("json_extract_string({expr}, '$')")
    }

    fn to_json(&self, expr: &str) -> String {
        format!("to_json({expr})")
    }

    fn json_exists(&self, expr: &str) -> String {
        format!(
            "({expr} IS NOT NULL AND json_type({expr}) <> 'NULL' AND CAST({expr} AS VARCHAR) <> '[]')"
        )
    }

    fn json_array(&self, expr: &str) -> String {
        format!(
            "(CASE WHEN {expr} IS NULL OR json_type({expr}) = 'NULL' THEN '[]'::JSON \
             WHEN json_type({expr}) = 'ARRAY' THEN {expr} \
             ELSE json_array({expr}) END)"
        )
    }

    fn array_length(&self, expr: &str) -> String {
        format!("json_array_length({})", self.json_array(expr))
    }

    fn unnest_source(&self, array_expr: &str, alias: &str) -> String {
        let list = format!("CAST({} AS JSON[])", self.json_array(array_expr));
        format!(
            "(SELECT unnest({list}) AS value, generate_subscripts({list}, 1) AS ordinality) AS {alias}"
        )
    }

    fn aggregate_json_array(&self, value: &str, order_by: &str) -> String {
        format!("json_group_array({value} ORDER BY {order_by})")
    }

    fn aggregate_distinct_json_array(&self, value: &str) -> String {
        format!("json_group_array(DISTINCT {value})")
    }

    fn empty_json_array(&self) -> String {
        "'[]'::JSON".to_string()
    }

    fn split_to_json_array(&self, text: &str, separator: &str) -> String {
        format!("to_json(string_split({text}, {separator}))")
    }

    fn type_name(&self, sql_type: SqlDataType) -> &'static str {
        match sql_type {
            SqlDataType::Text => "VARCHAR",
            SqlDataType::Integer => "BIGINT",
            SqlDataType::Decimal => "DOUBLE",
            SqlDataType::Boolean => "BOOLEAN",
            SqlDataType::Date => "DATE",
            SqlDataType::Timestamp => "TIMESTAMP",
            SqlDataType::Time => "TIME",
            SqlDataType::Json => "JSON",
        }
    }

    fn safe_cast(&self, expr: &str, sql_type: SqlDataType) -> String {
        format!("TRY_CAST({expr} AS {})", self.type_name(sql_type))
    }

    fn integer_division(&self, left: &str, right: &str) -> String {
        format!("CAST(TRUNC({left} / {right}) AS BIGINT)")
    }

    fn regex_match(&self, expr: &str, pattern: &str) -> String {
        format!("regexp_matches({expr}, {pattern})")
    }

    fn string_function(&self, function: StringFunction, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("NULL");
        match function {
            StringFunction::StartsWith => format!("starts_with({}, {})", arg(0), arg(1)),
            StringFunction::EndsWith => format!("ends_with({}, {})", arg(0), arg(1)),
            StringFunction::Contains => format!("contains({}, {})", arg(0), arg(1)),
            _ => ansi_string_function(function, args),
        }
    }

    fn math_function(&self, function: MathFunction, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("NULL");
        match function {
            MathFunction::Log => format!("(LN({}) / LN({}))", arg(0), arg(1)),
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
        let dialect = DuckDbDialect::new();
        assert_eq!(
            dialect.extract_json_object("resource", &path(&["name"])),
            "json_extract(resource, '$.name')"
        );
        assert_eq!(
            dialect.extract_json_text("elem.value", &path(&["use"])),
            "json_extract_string(elem.value, '$.use')"
        );
    }

    #[test]
    fn test_flatten_unnests_each_level() {
        let dialect = DuckDbDialect::new();
        let sql = dialect.flatten_json_path("src.resource", &path(&["name", "family"]), true);
        assert!(sql.starts_with("(SELECT CASE COUNT(*) WHEN 0 THEN NULL WHEN 1 THEN json_extract("));
        assert!(sql.contains("json_extract(src.resource, '$.name')"));
        assert!(sql.contains("json_extract(nav1.value, '$.family')"));
        assert!(sql.contains("AS nav1 CROSS JOIN LATERAL (SELECT unnest("));
        assert!(sql.contains("json_group_array(nav2.value ORDER BY nav1.ordinality, nav2.ordinality)"));
        assert!(!sql.contains("$.name.family"));
    }

    #[test]
    fn test_json_path_quotes_unusual_keys() {
        assert_eq!(DuckDbDialect::json_path(&path(&["a-b", "c"])), "$.\"a-b\".c");
    }

    #[test]
    fn test_safe_cast_uses_try_cast() {
        let dialect = DuckDbDialect::new();
        assert_eq!(
            dialect.safe_cast("x", SqlDataType::Decimal),
            "TRY_CAST(x AS DOUBLE)"
        );
    }

    #[test]
    fn test_log_is_change_of_base() {
        let dialect = DuckDbDialect::new();
        let sql = dialect.math_function(MathFunction::Log, &["x".to_string(), "10".to_string()]);
        assert_eq!(sql, "(LN(x) / LN(10))");
    }
}
