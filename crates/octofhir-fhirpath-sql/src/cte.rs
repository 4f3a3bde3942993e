//! CTE construction and query assembly.
//!
//! [`CteBuilder`] turns every fragment into one named `SELECT` that carries
//! the document identity and the whole document alongside the computed
//! value, so later CTEs can still reach the full record. Aggregates over
//! element rows are joined back onto the last document-level table, so a
//! document whose elements were all filtered out still yields a row.
//! [`CteAssembler`] validates dependencies and joins the CTEs into one
//! statement that projects `id` and the result column.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use crate::config::CompilerConfig;
use crate::dialect::SqlDialect;
use crate::fragment::{
    self, DOCUMENT_ALIAS, ELEMENT_ALIAS, ITEM_INDEX_COLUMN, RESULT_COLUMN, SOURCE_ALIAS,
    SqlFragment,
};
use crate::{Error, Result};

/// Name of the `index`-th CTE, counted from one.
pub(crate) fn cte_name(index: usize) -> String {
    format!("cte_{index}")
}

/// A named sub-query of the final `WITH` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Cte {
    pub name: String,
    pub query: String,

    /// CTEs or external tables this query reads from.
    pub depends_on: Vec<String>,

    pub requires_unnest: bool,
    pub metadata: BTreeMap<String, Value>,

    /// Fragment the CTE was built from.
    pub source_fragment: Option<SqlFragment>,

    /// Column holding the computed value.
    pub result_alias: String,
}

impl Cte {
    /// Create a CTE without dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCte`] if the name or query is empty.
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let query = query.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidCte("name must be a non-empty string".to_string()));
        }
        if query.trim().is_empty() {
            return Err(Error::InvalidCte(format!(
                "query for {name} must be a non-empty string"
            )));
        }
        Ok(Self {
            name,
            query,
            depends_on: Vec::new(),
            requires_unnest: false,
            metadata: BTreeMap::new(),
            source_fragment: None,
            result_alias: RESULT_COLUMN.to_string(),
        })
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_source_fragment(mut self, fragment: SqlFragment) -> Self {
        self.requires_unnest = fragment.requires_unnest();
        self.metadata = fragment.metadata().clone();
        if let Some(alias) = fragment.metadata_str(fragment::RESULT_ALIAS) {
            self.result_alias = alias.to_string();
        }
        self.source_fragment = Some(fragment);
        self
    }
}

/// Wraps fragments into CTE queries.
#[derive(Debug, Clone)]
pub struct CteBuilder {
    dialect: Arc<dyn SqlDialect>,
    id_column: String,
    resource_column: String,
}

impl CteBuilder {
    /// Builder for tables with `id` and `resource` columns.
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        Self::with_dialect(&CompilerConfig::default(), dialect)
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        Self::with_dialect(config, config.dialect())
    }

    pub fn with_dialect(config: &CompilerConfig, dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            dialect,
            id_column: config.id_column.clone(),
            resource_column: config.resource_column.clone(),
        }
    }

    /// Build one CTE per fragment, named `cte_1`, `cte_2`, ... in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyCteChain`] for an empty list and
    /// [`Error::MissingArrayColumnMetadata`] for an unnesting fragment that
    /// does not name its array.
    pub fn build_cte_chain(&self, fragments: &[SqlFragment]) -> Result<Vec<Cte>> {
        if fragments.is_empty() {
            return Err(Error::EmptyCteChain);
        }

        let mut ctes: Vec<Cte> = Vec::with_capacity(fragments.len());
        for (position, fragment) in fragments.iter().enumerate() {
            let name = cte_name(position + 1);
            let is_cte = |table: &str| ctes.iter().any(|cte| cte.name == table);
            let document = fragment
                .metadata_str(fragment::DOCUMENT_TABLE)
                .filter(|_| fragment.is_aggregate());
            let query = match document {
                Some(document) => {
                    self.build_regrouping_query(&name, fragment, document, is_cte(document))?
                }
                None => self.build_query(&name, fragment, is_cte(fragment.source_table()))?,
            };
            trace!(cte = %name, source = fragment.source_table(), "Built CTE");

            let cte = Cte::new(name, query)?
                .with_dependencies(fragment.effective_dependencies())
                .with_source_fragment(fragment.clone());
            ctes.push(cte);
        }

        debug!(ctes = ctes.len(), "Built CTE chain");
        Ok(ctes)
    }

    fn build_query(&self, name: &str, fragment: &SqlFragment, reads_cte: bool) -> Result<String> {
        let (id, document) = if reads_cte {
            (
                format!("{SOURCE_ALIAS}.id"),
                format!("{SOURCE_ALIAS}.resource"),
            )
        } else {
            (
                format!("{SOURCE_ALIAS}.{}", self.id_column),
                format!("{SOURCE_ALIAS}.{}", self.resource_column),
            )
        };
        let alias = fragment
            .metadata_str(fragment::RESULT_ALIAS)
            .unwrap_or(RESULT_COLUMN);

        let mut columns = if reads_cte {
            vec![id.clone(), document.clone()]
        } else {
            vec![format!("{id} AS id"), format!("{document} AS resource")]
        };
        columns.push(format!("{} AS {alias}", fragment.expression()));

        let element_rows = fragment.metadata_flag(fragment::SOURCE_ELEMENT_ROWS);
        let array = array_column(name, fragment)?;

        if !fragment.is_aggregate() {
            match array {
                Some(_) => {
                    let order = if element_rows {
                        format!("{SOURCE_ALIAS}.{ITEM_INDEX_COLUMN}, {ELEMENT_ALIAS}.ordinality")
                    } else {
                        format!("{ELEMENT_ALIAS}.ordinality")
                    };
                    columns.push(format!(
                        "{} AS {ITEM_INDEX_COLUMN}",
                        self.dialect.row_number(&id, &order)
                    ));
                }
                None if element_rows => {
                    columns.push(format!("{SOURCE_ALIAS}.{ITEM_INDEX_COLUMN}"));
                }
                None => {}
            }
        }

        let mut query = format!(
            "SELECT {}\nFROM {} AS {SOURCE_ALIAS}",
            columns.join(", "),
            fragment.source_table()
        );
        if let Some(array) = array {
            query.push('\n');
            query.push_str(&self.dialect.lateral_unnest(array, ELEMENT_ALIAS));
        }
        if let Some(condition) = fragment.metadata_str(fragment::FILTER_CONDITION) {
            query.push_str(&format!("\nWHERE {condition}"));
        }
        if fragment.is_aggregate() {
            query.push_str(&format!("\nGROUP BY {id}, {document}"));
        }
        Ok(query)
    }

    /// Aggregate the element rows of the fragment's source per document of
    /// `document`, producing one row even for documents without elements.
    fn build_regrouping_query(
        &self,
        name: &str,
        fragment: &SqlFragment,
        document: &str,
        document_is_cte: bool,
    ) -> Result<String> {
        let (id, resource) = if document_is_cte {
            ("id", "resource")
        } else {
            (self.id_column.as_str(), self.resource_column.as_str())
        };
        let id = format!("{DOCUMENT_ALIAS}.{id}");
        let resource = format!("{DOCUMENT_ALIAS}.{resource}");
        let alias = fragment
            .metadata_str(fragment::RESULT_ALIAS)
            .unwrap_or(RESULT_COLUMN);

        let mut query = format!(
            "SELECT {id} AS id, {resource} AS resource, {} AS {alias}\n\
             FROM {document} AS {DOCUMENT_ALIAS}\n\
             LEFT JOIN {} AS {SOURCE_ALIAS} ON {SOURCE_ALIAS}.id = {id}",
            fragment.expression(),
            fragment.source_table()
        );
        if let Some(array) = array_column(name, fragment)? {
            query.push('\n');
            query.push_str(&self.dialect.left_lateral_unnest(array, ELEMENT_ALIAS));
        }
        query.push_str(&format!("\nGROUP BY {id}, {resource}"));
        Ok(query)
    }
}

/// The array an unnesting fragment iterates.
fn array_column<'f>(name: &str, fragment: &'f SqlFragment) -> Result<Option<&'f str>> {
    if !fragment.requires_unnest() {
        return Ok(None);
    }
    fragment
        .metadata_str(fragment::ARRAY_COLUMN)
        .map(Some)
        .ok_or_else(|| Error::MissingArrayColumnMetadata {
            cte: name.to_string(),
        })
}

/// Orders CTEs by dependency and renders the final statement.
#[derive(Debug, Clone)]
pub struct CteAssembler {
    external_tables: BTreeSet<String>,
}

impl Default for CteAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl CteAssembler {
    /// Assembler whose only external table is `resource`.
    pub fn new() -> Self {
        Self {
            external_tables: BTreeSet::from(["resource".to_string()]),
        }
    }

    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            external_tables: config.external_table_set(),
        }
    }

    #[must_use]
    pub fn with_external_table(mut self, table: impl Into<String>) -> Self {
        self.external_tables.insert(table.into());
        self
    }

    pub fn external_tables(&self) -> &BTreeSet<String> {
        &self.external_tables
    }

    /// Render `ctes` as one statement selecting from the last CTE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyCteChain`], [`Error::InvalidCte`] for duplicate
    /// names, [`Error::MissingDependencies`] naming every unresolved
    /// dependency, or [`Error::CircularDependency`].
    pub fn assemble_query(&self, ctes: &[Cte]) -> Result<String> {
        let terminal = ctes.last().ok_or(Error::EmptyCteChain)?;

        let mut names = HashSet::with_capacity(ctes.len());
        for cte in ctes {
            if !names.insert(cte.name.as_str()) {
                return Err(Error::InvalidCte(format!("duplicate CTE name {}", cte.name)));
            }
        }

        let mut missing: Vec<String> = Vec::new();
        for dependency in ctes.iter().flat_map(|cte| &cte.depends_on) {
            if !names.contains(dependency.as_str())
                && !self.external_tables.contains(dependency)
                && !missing.contains(dependency)
            {
                missing.push(dependency.clone());
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingDependencies(missing));
        }

        if let [cte] = ctes {
            if cte.depends_on.iter().all(|d| !names.contains(d.as_str())) {
                return Ok(format!(
                    "SELECT id, {} FROM (\n{}\n) AS {}",
                    cte.result_alias, cte.query, cte.name
                ));
            }
        }

        let order = stable_topological_order(ctes)?;
        let clauses: Vec<String> = order
            .iter()
            .map(|&index| format!("{} AS (\n{}\n)", ctes[index].name, ctes[index].query))
            .collect();
        debug!(ctes = ctes.len(), terminal = %terminal.name, "Assembled query");

        Ok(format!(
            "WITH {}\nSELECT id, {} FROM {}",
            clauses.join(",\n"),
            terminal.result_alias,
            terminal.name
        ))
    }
}

/// Kahn's algorithm, always taking the earliest ready CTE in input order.
fn stable_topological_order(ctes: &[Cte]) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = ctes
        .iter()
        .enumerate()
        .map(|(i, cte)| (cte.name.as_str(), i))
        .collect();

    let mut pending = vec![0usize; ctes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ctes.len()];
    for (i, cte) in ctes.iter().enumerate() {
        let mut seen = HashSet::new();
        for dependency in &cte.depends_on {
            if let Some(&j) = index.get(dependency.as_str()) {
                if seen.insert(j) {
                    pending[i] += 1;
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..ctes.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(ctes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < ctes.len() {
        let cycle = (0..ctes.len())
            .filter(|i| pending[*i] > 0)
            .map(|i| ctes[i].name.clone())
            .collect();
        return Err(Error::CircularDependency(cycle));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;

    fn builder() -> CteBuilder {
        CteBuilder::new(Arc::new(PostgresDialect::new()))
    }

    fn cte(name: &str, depends_on: &[&str]) -> Cte {
        Cte::new(name, format!("SELECT {name}"))
            .unwrap()
            .with_dependencies(depends_on.iter().copied())
    }

    #[test]
    fn test_plain_fragment_projects_identity() {
        let fragment = SqlFragment::new("src.resource->'name'", "resource").unwrap();
        let ctes = builder().build_cte_chain(&[fragment]).unwrap();

        assert_eq!(ctes.len(), 1);
        assert_eq!(ctes[0].name, "cte_1");
        assert!(ctes[0].depends_on.is_empty());
        assert_eq!(
            ctes[0].query,
            "SELECT src.id AS id, src.resource AS resource, src.resource->'name' AS result\n\
             FROM resource AS src"
        );
    }

    #[test]
    fn test_unnest_fragment_numbers_rows_per_document() {
        let fragment = SqlFragment::new("elem.value", "cte_1")
            .unwrap()
            .with_dependency("cte_1")
            .with_unnest("src.result")
            .with_metadata(fragment::FILTER_CONDITION, "(elem.value->>'use' = 'official')")
            .with_metadata(fragment::SOURCE_ELEMENT_ROWS, true);
        let previous = SqlFragment::new("src.resource->'name'", "resource").unwrap();
        let ctes = builder().build_cte_chain(&[previous, fragment]).unwrap();

        let query = &ctes[1].query;
        assert!(query.contains(
            "ROW_NUMBER() OVER (PARTITION BY src.id ORDER BY src.item_index, elem.ordinality) AS item_index"
        ));
        assert!(query.contains("\nFROM cte_1 AS src\nCROSS JOIN LATERAL jsonb_array_elements("));
        assert!(query.ends_with("\nWHERE (elem.value->>'use' = 'official')"));
        assert_eq!(ctes[1].depends_on, vec!["cte_1"]);
        assert!(ctes[1].requires_unnest);
    }

    #[test]
    fn test_aggregate_groups_by_document() {
        let fragment = SqlFragment::new("jsonb_agg(elem.value ORDER BY elem.ordinality)", "resource")
            .unwrap()
            .with_unnest("src.resource->'name'")
            .with_aggregate(true);
        let ctes = builder().build_cte_chain(&[fragment]).unwrap();
        assert!(ctes[0].query.ends_with("\nGROUP BY src.id, src.resource"));
        assert!(!ctes[0].query.contains("ROW_NUMBER"));
    }

    #[test]
    fn test_missing_array_column_is_fatal() {
        let fragment = SqlFragment::new("elem.value", "resource")
            .unwrap()
            .with_requires_unnest(true);
        let err = builder().build_cte_chain(&[fragment]).unwrap_err();
        assert!(matches!(err, Error::MissingArrayColumnMetadata { ref cte } if cte == "cte_1"));
    }

    #[test]
    fn test_explicit_dependencies_win() {
        let fragment = SqlFragment::new("src.result", "cte_1")
            .unwrap()
            .with_dependency("cte_1")
            .with_explicit_dependencies(vec!["resource".into()]);
        let first = SqlFragment::new("src.resource", "resource").unwrap();
        let ctes = builder().build_cte_chain(&[first, fragment]).unwrap();
        assert_eq!(ctes[1].depends_on, vec!["resource"]);
    }

    #[test]
    fn test_empty_chain() {
        assert!(matches!(
            builder().build_cte_chain(&[]),
            Err(Error::EmptyCteChain)
        ));
        assert!(matches!(
            CteAssembler::new().assemble_query(&[]),
            Err(Error::EmptyCteChain)
        ));
    }

    #[test]
    fn test_single_cte_skips_with_clause() {
        let sql = CteAssembler::new()
            .assemble_query(&[cte("cte_1", &["resource"])])
            .unwrap();
        assert_eq!(sql, "SELECT id, result FROM (\nSELECT cte_1\n) AS cte_1");
    }

    #[test]
    fn test_single_and_chained_queries_project_same_columns() {
        let single = CteAssembler::new()
            .assemble_query(&[cte("cte_1", &[])])
            .unwrap();
        let chained = CteAssembler::new()
            .assemble_query(&[cte("cte_1", &[]), cte("cte_2", &["cte_1"])])
            .unwrap();
        let projection = |sql: &str| {
            let select = sql.rfind("SELECT id, ").unwrap();
            sql[select..].split(" FROM ").next().unwrap().to_string()
        };
        assert!(single.starts_with("SELECT id, result FROM ("));
        assert_eq!(projection(&single), "SELECT id, result");
        assert_eq!(projection(&chained), projection(&single));

        let renamed = Cte::new("cte_1", "SELECT 1").unwrap().with_source_fragment(
            SqlFragment::new("1", "resource")
                .unwrap()
                .with_metadata(fragment::RESULT_ALIAS, "value"),
        );
        let sql = CteAssembler::new().assemble_query(&[renamed]).unwrap();
        assert!(sql.starts_with("SELECT id, value FROM (\n"));
    }

    #[test]
    fn test_regrouping_joins_back_to_every_document() {
        let filter = SqlFragment::new("elem.value", "resource")
            .unwrap()
            .with_unnest("src.resource->'name'")
            .with_metadata(fragment::FILTER_CONDITION, "(elem.value->>'use' = 'official')");
        let count = SqlFragment::new("COUNT(elem.value)", "cte_1")
            .unwrap()
            .with_dependency("cte_1")
            .with_unnest("src.result")
            .with_aggregate(true)
            .with_metadata(fragment::SOURCE_ELEMENT_ROWS, true)
            .with_metadata(fragment::DOCUMENT_TABLE, "resource");
        let ctes = builder().build_cte_chain(&[filter, count]).unwrap();

        let query = &ctes[1].query;
        assert!(query.starts_with(
            "SELECT doc.id AS id, doc.resource AS resource, COUNT(elem.value) AS result\n\
             FROM resource AS doc\n\
             LEFT JOIN cte_1 AS src ON src.id = doc.id\n\
             LEFT JOIN LATERAL jsonb_array_elements("
        ));
        assert!(query.contains("WITH ORDINALITY AS elem(value, ordinality) ON TRUE"));
        assert!(query.ends_with("\nGROUP BY doc.id, doc.resource"));
        assert_eq!(ctes[1].depends_on, vec!["cte_1"]);
    }

    #[test]
    fn test_regrouping_onto_a_cte_uses_its_columns() {
        let config = CompilerConfig::default()
            .with_id_column("key")
            .with_resource_column("body");
        let builder = CteBuilder::with_dialect(&config, Arc::new(PostgresDialect::new()));
        let first = SqlFragment::new("src.body->'name'", "resource").unwrap();
        let rows = SqlFragment::new("elem.value", "cte_1")
            .unwrap()
            .with_dependency("cte_1")
            .with_unnest("src.result");
        let collect = SqlFragment::new("jsonb_agg(elem.value ORDER BY src.item_index)", "cte_2")
            .unwrap()
            .with_dependency("cte_2")
            .with_dependency("cte_1")
            .with_unnest("src.result")
            .with_aggregate(true)
            .with_metadata(fragment::DOCUMENT_TABLE, "cte_1");
        let ctes = builder.build_cte_chain(&[first, rows, collect]).unwrap();

        assert!(ctes[0].query.starts_with("SELECT src.key AS id, src.body AS resource"));
        assert!(ctes[2].query.contains("FROM cte_1 AS doc\nLEFT JOIN cte_2 AS src ON src.id = doc.id"));
        assert!(ctes[2].query.ends_with("GROUP BY doc.id, doc.resource"));
        assert_eq!(ctes[2].depends_on, vec!["cte_2", "cte_1"]);
    }

    #[test]
    fn test_missing_dependencies_are_all_named() {
        let err = CteAssembler::new()
            .assemble_query(&[
                cte("cte_1", &["unknown_table"]),
                cte("cte_2", &["cte_1", "other", "unknown_table"]),
            ])
            .unwrap_err();
        match err {
            Error::MissingDependencies(names) => assert_eq!(names, vec!["unknown_table", "other"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_external_tables_are_configurable() {
        let assembler = CteAssembler::new().with_external_table("terminology");
        let sql = assembler
            .assemble_query(&[cte("cte_1", &["terminology"])])
            .unwrap();
        assert_eq!(sql, "SELECT id, result FROM (\nSELECT cte_1\n) AS cte_1");
    }

    #[test]
    fn test_stable_order_keeps_independent_ctes_in_place() {
        let ctes = [
            cte("c", &["b"]),
            cte("a", &[]),
            cte("b", &[]),
            cte("d", &[]),
        ];
        let sql = CteAssembler::new().assemble_query(&ctes).unwrap();
        let position = |name: &str| sql.find(&format!("{name} AS (")).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("b") < position("c"));
        assert!(position("c") < position("d"));
        assert!(sql.ends_with("SELECT id, result FROM d"));
    }

    #[test]
    fn test_cycle_is_detected() {
        let err = CteAssembler::new()
            .assemble_query(&[cte("a", &["b"]), cte("b", &["a"]), cte("c", &[])])
            .unwrap_err();
        match err {
            Error::CircularDependency(names) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let err = CteAssembler::new()
            .assemble_query(&[cte("a", &[]), cte("a", &[])])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCte(_)));
    }

    #[test]
    fn test_cte_requires_name_and_query() {
        assert!(matches!(Cte::new("", "SELECT 1"), Err(Error::InvalidCte(_))));
        assert!(matches!(Cte::new("cte_1", " "), Err(Error::InvalidCte(_))));
    }
}
