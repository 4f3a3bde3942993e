//! Unary and binary operators.

use std::sync::Arc;

use crate::ast::{Arity, AstNode, LiteralType, SqlDataType};
use crate::context::ValueType;
use crate::dialect::{LogicalOperator, SqlDialect};
use crate::{Error, Result};

use super::temporal::{self, TemporalBounds, TemporalLiteral};
use super::{Expr, Translator};

impl Translator {
    pub(super) fn operator(&mut self, node: &AstNode, symbol: &str, arity: Arity) -> Result<Expr> {
        let expected = arity.operand_count();
        if node.children.len() != expected {
            return Err(Error::InvalidOperatorArity {
                operator: symbol.to_string(),
                expected,
                actual: node.children.len(),
            });
        }

        if arity == Arity::Unary {
            let operand = self.operand(&node.children[0])?;
            return self.unary(symbol, &operand);
        }

        let (left, right) = (&node.children[0], &node.children[1]);
        match symbol {
            "[]" => {
                let collection = self.operand(left)?;
                let index = self.operand(right)?;
                self.element_at(&collection, Some(&index), false)
            }
            "|" => {
                let left = self.operand(left)?;
                let right = self.operand(right)?;
                Ok(self.union(&left, &right))
            }
            "in" => {
                let element = self.operand(left)?;
                let collection = self.operand(right)?;
                Ok(self.membership(&element, &collection))
            }
            "contains" => {
                let collection = self.operand(left)?;
                let element = self.operand(right)?;
                Ok(self.membership(&element, &collection))
            }
            _ => {
                let left = self.operand(left)?;
                let right = self.operand(right)?;
                self.binary(symbol, &left, &right)
            }
        }
    }

    fn unary(&self, symbol: &str, operand: &Expr) -> Result<Expr> {
        let (value, ty) = operand.numeric(self.dialect());
        match symbol {
            "-" => Ok(Expr::new(format!("(-{value})"), ty)),
            "+" => Ok(Expr::new(value, ty)),
            _ => Err(Error::UnknownOperator(symbol.to_string())),
        }
    }

    fn binary(&self, symbol: &str, left: &Expr, right: &Expr) -> Result<Expr> {
        let d = self.dialect();

        if let Some(operator) = LogicalOperator::from_symbol(symbol) {
            return Ok(Expr::new(
                d.logical(operator, &left.boolean(d), &right.boolean(d)),
                ValueType::Boolean,
            ));
        }

        match symbol {
            "&" => Ok(Expr::new(
                d.string_concat(&left.text(d), &right.text(d)),
                ValueType::String,
            )),
            "+" if left.ty == ValueType::String && right.ty == ValueType::String => Ok(
                Expr::new(d.string_concat(&left.sql, &right.sql), ValueType::String),
            ),
            "+" | "-" | "*" => {
                let (l, left_type) = left.numeric(d);
                let (r, right_type) = right.numeric(d);
                let ty = if left_type == ValueType::Integer && right_type == ValueType::Integer {
                    ValueType::Integer
                } else {
                    ValueType::Decimal
                };
                Ok(Expr::new(d.arithmetic(symbol, &l, &r), ty))
            }
            "/" => {
                if right.is_zero_literal() {
                    return Ok(Expr::new(d.typed_null(SqlDataType::Decimal), ValueType::Decimal));
                }
                let (l, _) = left.numeric(d);
                let (r, _) = right.numeric(d);
                Ok(Expr::new(
                    d.arithmetic(
                        "/",
                        &d.cast(&l, SqlDataType::Decimal),
                        &format!("NULLIF({r}, 0)"),
                    ),
                    ValueType::Decimal,
                ))
            }
            "div" => {
                if right.is_zero_literal() {
                    return Ok(Expr::new(d.typed_null(SqlDataType::Integer), ValueType::Integer));
                }
                let (l, _) = left.numeric(d);
                let (r, _) = right.numeric(d);
                Ok(Expr::new(
                    d.integer_division(&l, &format!("NULLIF({r}, 0)")),
                    ValueType::Integer,
                ))
            }
            "mod" => {
                let (l, left_type) = left.numeric(d);
                let (r, right_type) = right.numeric(d);
                let ty = if left_type == ValueType::Integer && right_type == ValueType::Integer {
                    ValueType::Integer
                } else {
                    ValueType::Decimal
                };
                if right.is_zero_literal() {
                    let null_type = if ty == ValueType::Integer {
                        SqlDataType::Integer
                    } else {
                        SqlDataType::Decimal
                    };
                    return Ok(Expr::new(d.typed_null(null_type), ty));
                }
                Ok(Expr::new(d.modulo(&l, &format!("NULLIF({r}, 0)")), ty))
            }
            "=" | "!=" | "<" | ">" | "<=" | ">=" => self.compare(symbol, left, right),
            "~" | "!~" => {
                let (l, r) = (left.text(d), right.text(d));
                let equivalent =
                    format!("COALESCE(LOWER({l}) = LOWER({r}), {l} IS NULL AND {r} IS NULL)");
                let sql = if symbol == "~" {
                    format!("({equivalent})")
                } else {
                    d.not(&equivalent)
                };
                Ok(Expr::new(sql, ValueType::Boolean))
            }
            _ => Err(Error::UnknownOperator(symbol.to_string())),
        }
    }

    fn compare(&self, symbol: &str, left: &Expr, right: &Expr) -> Result<Expr> {
        let d = self.dialect();
        let left_temporal = left.temporal_literal().transpose()?;
        let right_temporal = right.temporal_literal().transpose()?;

        let ranges = match (&left_temporal, &right_temporal) {
            (Some(l), Some(r)) if l.precision != r.precision => Some((l.bounds(d), r.bounds(d))),
            (Some(l), None) if !l.is_full_precision() && right.ty != ValueType::Null => Some((
                l.bounds(d),
                TemporalBounds::point(right.typed(d, temporal_sql_type(l))),
            )),
            (None, Some(r)) if !r.is_full_precision() && left.ty != ValueType::Null => Some((
                TemporalBounds::point(left.typed(d, temporal_sql_type(r))),
                r.bounds(d),
            )),
            _ => None,
        };
        if let Some((l, r)) = ranges {
            if let Some(sql) = temporal::compare_ranges(symbol, &l, &r) {
                return Ok(Expr::new(sql, ValueType::Boolean));
            }
        }

        let (l, r) = comparable(d, left, right);
        Ok(Expr::new(d.comparison(symbol, &l, &r), ValueType::Boolean))
    }

    /// `element in collection`, compared as text.
    fn membership(&mut self, element: &Expr, collection: &Expr) -> Expr {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let alias = self.context.next_alias("e");
        let candidate = d.json_to_text(&format!("{alias}.value"));
        Expr::new(
            format!(
                "(EXISTS (SELECT 1 FROM {} WHERE {}))",
                d.unnest_source(&collection.json(d), &alias),
                d.comparison("=", &candidate, &element.text(d))
            ),
            ValueType::Boolean,
        )
    }

    /// `left | right` without duplicates.
    fn union(&mut self, left: &Expr, right: &Expr) -> Expr {
        let dialect = Arc::clone(&self.dialect);
        let d = dialect.as_ref();
        let first = self.context.next_alias("e");
        let second = self.context.next_alias("e");
        let merged = self.context.next_alias("u");
        Expr::new(
            format!(
                "(SELECT {} FROM (SELECT {first}.value FROM {} UNION ALL SELECT {second}.value FROM {}) AS {merged})",
                d.aggregate_distinct_json_array(&format!("{merged}.value")),
                d.unnest_source(&left.json(d), &first),
                d.unnest_source(&right.json(d), &second)
            ),
            ValueType::Json,
        )
    }
}

fn temporal_sql_type(literal: &TemporalLiteral) -> SqlDataType {
    match literal.literal_type {
        LiteralType::Date => SqlDataType::Date,
        LiteralType::Time => SqlDataType::Time,
        _ => SqlDataType::Timestamp,
    }
}

fn sql_type(ty: ValueType) -> Option<SqlDataType> {
    match ty {
        ValueType::String => Some(SqlDataType::Text),
        ValueType::Integer | ValueType::Decimal => Some(SqlDataType::Decimal),
        ValueType::Boolean => Some(SqlDataType::Boolean),
        ValueType::Date => Some(SqlDataType::Date),
        ValueType::DateTime => Some(SqlDataType::Timestamp),
        ValueType::Time => Some(SqlDataType::Time),
        ValueType::Json | ValueType::Null => None,
    }
}

/// Both sides of a comparison in a common SQL type.
fn comparable(d: &dyn SqlDialect, left: &Expr, right: &Expr) -> (String, String) {
    match (left.ty, right.ty) {
        (ValueType::Json, ValueType::Json) => (left.text(d), right.text(d)),
        (ValueType::Json, other) => match sql_type(other) {
            Some(target) => (left.typed(d, target), right.sql.clone()),
            None => (left.text(d), right.sql.clone()),
        },
        (other, ValueType::Json) => match sql_type(other) {
            Some(target) => (left.sql.clone(), right.typed(d, target)),
            None => (left.sql.clone(), right.text(d)),
        },
        _ => (left.sql.clone(), right.sql.clone()),
    }
}
