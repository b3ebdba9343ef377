//! Statement construction
//!
//! Every identifier is validated and quoted, every value is bound as a
//! parameter. Nothing from a request is ever spliced into SQL text.

use serde_json::Value;

use super::{check_identifier, Dialect, SqlClause, Statement};
use crate::error::{Error, Result};
use crate::model::{FieldMap, Filter};

/// Builds parameterized statements for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    dialect: Dialect,
}

impl QueryBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn quoted(&self, ident: &str) -> Result<String> {
        Ok(self.dialect.quote(check_identifier(ident)?))
    }

    // =========================================================================
    // Clauses
    // =========================================================================

    /// WHERE body for a declarative filter.
    pub fn where_clause(&self, filter: &Filter) -> Result<SqlClause> {
        if filter.is_empty() {
            return Err(Error::InvalidCondition {
                field: "*".to_string(),
                reason: "filter has no conditions".to_string(),
            });
        }

        let mut parts = Vec::new();
        let mut params = Vec::new();

        for (field, condition) in filter {
            let column = self.quoted(field)?;
            let invalid = |reason: &str| Error::InvalidCondition {
                field: field.clone(),
                reason: reason.to_string(),
            };

            if condition.is_empty() {
                return Err(invalid("no operator given"));
            }
            if condition.len() > 1 && condition.iter().any(|(op, _)| op.is_exclusive()) {
                return Err(invalid("'=' and 'in' cannot be combined with other operators"));
            }

            for (op, values) in condition.iter() {
                if values.is_empty() {
                    return Err(invalid("operator has no values"));
                }
                if op.is_set() {
                    let marks = vec!["?"; values.len()].join(", ");
                    parts.push(format!("{} {} ({})", column, op.as_sql(), marks));
                } else if values.len() == 1 {
                    parts.push(format!("{} {} ?", column, op.as_sql()));
                } else {
                    return Err(invalid("operator takes exactly one value"));
                }
                params.extend(values.iter().cloned().map(Value::String));
            }
        }

        Ok(SqlClause {
            sql: parts.join(" AND "),
            params,
        })
    }

    /// Clause matching one row by its key columns, taken from `row`.
    ///
    /// Returns `None` if the row lacks any key column or a key is null.
    pub fn primary_clause(&self, indexes: &[String], row: &FieldMap) -> Result<Option<SqlClause>> {
        if indexes.is_empty() {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(indexes.len());
        let mut params = Vec::with_capacity(indexes.len());
        for column in indexes {
            match row.get(column) {
                Some(value) if !value.is_null() => {
                    parts.push(format!("{} = ?", self.quoted(column)?));
                    params.push(value.clone());
                }
                _ => return Ok(None),
            }
        }

        Ok(Some(SqlClause {
            sql: parts.join(" AND "),
            params,
        }))
    }

    /// Clause binding a single-column key to the key id.
    pub fn id_clause(&self, column: &str, id: &str) -> Result<SqlClause> {
        Ok(SqlClause {
            sql: format!("{} = ?", self.quoted(column)?),
            params: vec![Value::String(id.to_string())],
        })
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub fn select(&self, table: &str, clause: &SqlClause, limit: Option<u32>) -> Result<Statement> {
        let mut sql = format!("SELECT * FROM {} WHERE {}", self.quoted(table)?, clause.sql);
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(Statement::new(sql, clause.params.clone()))
    }

    /// Columns in submission order.
    pub fn insert(&self, table: &str, fields: &FieldMap) -> Result<Statement> {
        if fields.is_empty() {
            return Err(Error::MissingInput(format!("no fields to insert into {}", table)));
        }

        let columns = fields
            .keys()
            .map(|name| self.quoted(name))
            .collect::<Result<Vec<_>>>()?;
        let marks = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quoted(table)?,
            columns.join(", "),
            marks
        );
        Ok(Statement::new(sql, fields.values().cloned().collect()))
    }

    /// Update at most one row.
    pub fn update(&self, table: &str, changes: &FieldMap, clause: &SqlClause) -> Result<Statement> {
        if changes.is_empty() {
            return Err(Error::MissingInput(format!("no fields to update in {}", table)));
        }

        let assignments = changes
            .keys()
            .map(|name| Ok(format!("{} = ?", self.quoted(name)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.quoted(table)?,
            assignments.join(", "),
            clause.sql
        );
        if self.dialect.limits_mutations() {
            sql.push_str(" LIMIT 1");
        }

        let mut params: Vec<Value> = changes.values().cloned().collect();
        params.extend(clause.params.iter().cloned());
        Ok(Statement::new(sql, params))
    }

    /// Delete at most one row.
    pub fn delete(&self, table: &str, clause: &SqlClause) -> Result<Statement> {
        let mut sql = format!("DELETE FROM {} WHERE {}", self.quoted(table)?, clause.sql);
        if self.dialect.limits_mutations() {
            sql.push_str(" LIMIT 1");
        }
        Ok(Statement::new(sql, clause.params.clone()))
    }

    // =========================================================================
    // Default Table
    // =========================================================================

    pub fn create_default_table(&self, table: &str) -> Result<Statement> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id VARCHAR(255) NOT NULL, type VARCHAR(64) NOT NULL, \
             value TEXT, PRIMARY KEY (id, type))",
            self.quoted(table)?
        );
        Ok(Statement::new(sql, vec![]))
    }

    pub fn default_select(&self, table: &str, id: &str, kind: &str) -> Result<Statement> {
        let sql = format!(
            "SELECT value FROM {} WHERE id = ? AND type = ?",
            self.quoted(table)?
        );
        Ok(Statement::new(sql, vec![Value::from(id), Value::from(kind)]))
    }

    pub fn default_upsert(
        &self,
        table: &str,
        id: &str,
        kind: &str,
        value: String,
    ) -> Result<Statement> {
        let table = self.quoted(table)?;
        let sql = match self.dialect {
            Dialect::Sqlite => format!(
                "INSERT INTO {} (id, type, value) VALUES (?, ?, ?) \
                 ON CONFLICT (id, type) DO UPDATE SET value = excluded.value",
                table
            ),
            Dialect::MySql => format!(
                "INSERT INTO {} (id, type, value) VALUES (?, ?, ?) \
                 ON DUPLICATE KEY UPDATE value = VALUES(value)",
                table
            ),
        };
        Ok(Statement::new(
            sql,
            vec![Value::from(id), Value::from(kind), Value::String(value)],
        ))
    }

    pub fn default_delete(&self, table: &str, id: &str, kind: &str) -> Result<Statement> {
        let sql = format!("DELETE FROM {} WHERE id = ? AND type = ?", self.quoted(table)?);
        Ok(Statement::new(sql, vec![Value::from(id), Value::from(kind)]))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Condition, Operator, QueryInfo};
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    fn sqlite() -> QueryBuilder {
        QueryBuilder::new(Dialect::Sqlite)
    }

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_where_clause_range_and_set() {
        let query = QueryInfo::new("users")
            .when("age", Operator::Ge, "18")
            .when("age", Operator::Lt, "65")
            .when("role", Operator::In, "admin")
            .when("role", Operator::In, "staff");

        let clause = sqlite().where_clause(&query.filter).unwrap();
        assert_eq!(
            clause.sql,
            "\"age\" >= ? AND \"age\" < ? AND \"role\" IN (?, ?)"
        );
        assert_eq!(clause.params, vec![json!("18"), json!("65"), json!("admin"), json!("staff")]);
    }

    #[test]
    fn test_where_clause_rejects_ambiguous_conditions() {
        let query = QueryInfo::new("users")
            .when("age", Operator::Eq, "18")
            .when("age", Operator::Gt, "10");
        assert_matches!(
            sqlite().where_clause(&query.filter),
            Err(Error::InvalidCondition { field, .. }) if field == "age"
        );

        let mut filter = Filter::new();
        filter.insert(
            "age".into(),
            Condition::new().with(Operator::Gt, "1").with(Operator::Gt, "2"),
        );
        assert_matches!(
            sqlite().where_clause(&filter),
            Err(Error::InvalidCondition { .. })
        );

        filter.clear();
        filter.insert("age".into(), Condition::new());
        assert_matches!(
            sqlite().where_clause(&filter),
            Err(Error::InvalidCondition { .. })
        );

        assert_matches!(
            sqlite().where_clause(&Filter::new()),
            Err(Error::InvalidCondition { .. })
        );
    }

    #[test]
    fn test_where_clause_rejects_bad_field_names() {
        let query = QueryInfo::new("users").when("age; --", Operator::Eq, "1");
        assert_matches!(
            sqlite().where_clause(&query.filter),
            Err(Error::InvalidIdentifier(_))
        );
    }

    #[test]
    fn test_select_with_limit() {
        let clause = sqlite().id_clause("id", "42").unwrap();
        let stmt = sqlite().select("users", &clause, Some(1)).unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM \"users\" WHERE \"id\" = ? LIMIT 1");
        assert_eq!(stmt.params, vec![json!("42")]);
    }

    #[test]
    fn test_insert_keeps_submission_order() {
        let stmt = sqlite()
            .insert("users", &fields(json!({"name": "bob", "age": 30})))
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"name\", \"age\") VALUES (?, ?)"
        );
        assert_eq!(stmt.params, vec![json!("bob"), json!(30)]);
    }

    #[test]
    fn test_update_and_delete_are_single_row() {
        let clause = sqlite()
            .primary_clause(&["id".to_string()], &fields(json!({"id": 7, "name": "x"})))
            .unwrap()
            .unwrap();

        let stmt = sqlite()
            .update("users", &fields(json!({"name": "y"})), &clause)
            .unwrap();
        assert_eq!(stmt.sql, "UPDATE \"users\" SET \"name\" = ? WHERE \"id\" = ?");
        assert_eq!(stmt.params, vec![json!("y"), json!(7)]);

        let mysql = QueryBuilder::new(Dialect::MySql);
        let stmt = mysql.delete("users", &clause).unwrap();
        assert_eq!(stmt.sql, "DELETE FROM `users` WHERE `id` = ? LIMIT 1");
    }

    #[test]
    fn test_primary_clause_needs_every_key_column() {
        let indexes = vec!["org".to_string(), "id".to_string()];
        let row = fields(json!({"org": "a", "id": null}));
        assert!(sqlite().primary_clause(&indexes, &row).unwrap().is_none());
        assert!(sqlite().primary_clause(&[], &row).unwrap().is_none());

        let row = fields(json!({"id": 1, "org": "a"}));
        let clause = sqlite().primary_clause(&indexes, &row).unwrap().unwrap();
        assert_eq!(clause.sql, "\"org\" = ? AND \"id\" = ?");
        assert_eq!(clause.params, vec![json!("a"), json!(1)]);
    }

    #[test]
    fn test_default_table_upsert_per_dialect() {
        let stmt = sqlite()
            .default_upsert("kv_default", "foo", "data", "{}".into())
            .unwrap();
        assert!(stmt.sql.contains("ON CONFLICT (id, type)"));

        let stmt = QueryBuilder::new(Dialect::MySql)
            .default_upsert("kv_default", "foo", "data", "{}".into())
            .unwrap();
        assert!(stmt.sql.contains("ON DUPLICATE KEY UPDATE"));
        assert_eq!(stmt.params.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_placeholders_match_params(
            values in proptest::collection::vec("[a-z0-9]{1,5}", 1..6),
            lower in "[0-9]{1,3}",
        ) {
            let mut query = QueryInfo::new("t").when("n", Operator::Gt, lower);
            for value in &values {
                query = query.when("tag", Operator::In, value.clone());
            }
            let clause = sqlite().where_clause(&query.filter).unwrap();
            prop_assert_eq!(clause.sql.matches('?').count(), clause.params.len());
        }
    }
}
