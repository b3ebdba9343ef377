//! Routing metadata
//!
//! [`KeyInfo`] decides whether a key is backed by a named table or by the
//! generic default table, which filter first bound it, and how it expires.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::kv::KvPairs;
use super::query::QueryInfo;
use crate::error::{Error, Result};
use crate::expire::ExpirePolicy;
use crate::sql::SqlClause;

/// Routing metadata for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    /// Backing table; `None` routes to the default table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Expiration policy string
    #[serde(default)]
    pub expire: String,
    /// Never write this key back to the relational tier
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_db: bool,
    /// Filter that established the table binding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryInfo>,
    /// Resolved primary-key clause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clause: Option<String>,
    /// Values bound to `clause`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    /// Primary or unique index columns of the table
    #[serde(skip)]
    pub indexes: Vec<String>,
    /// Table columns
    #[serde(skip)]
    pub columns: Vec<String>,
    /// Not yet confirmed against a persisted tier
    #[serde(skip)]
    pub is_new: bool,
}

/// Which relational path a key takes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Routing<'a> {
    /// Backed by a named table
    Routed {
        table: &'a str,
        clause: Option<&'a str>,
        params: &'a [Value],
    },
    /// Backed by the default table
    Unrouted,
}

impl KeyInfo {
    /// Fresh, unpersisted metadata routed to the default table.
    pub fn new() -> Self {
        Self {
            is_new: true,
            ..Default::default()
        }
    }

    /// Fresh metadata bound to a table.
    pub fn for_table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::new()
        }
    }

    /// Fresh metadata bound through a query; the table follows the query.
    pub fn for_query(query: QueryInfo) -> Self {
        Self {
            table: Some(query.table.clone()),
            query: Some(query),
            ..Self::new()
        }
    }

    pub fn with_expire(mut self, expire: impl Into<String>) -> Self {
        self.expire = expire.into();
        self
    }

    pub fn without_db(mut self) -> Self {
        self.no_db = true;
        self
    }

    /// Tagged view of the relational path.
    pub fn routing(&self) -> Routing<'_> {
        match &self.table {
            Some(table) => Routing::Routed {
                table,
                clause: self.clause.as_deref(),
                params: &self.params,
            },
            None => Routing::Unrouted,
        }
    }

    /// Parsed expiration policy.
    pub fn expire_policy(&self) -> Result<ExpirePolicy> {
        ExpirePolicy::parse(&self.expire)
    }

    /// Cached primary-key clause, if resolved.
    pub fn primary_clause(&self) -> Option<SqlClause> {
        self.clause.as_ref().map(|sql| SqlClause {
            sql: sql.clone(),
            params: self.params.clone(),
        })
    }

    /// Cache a resolved primary-key clause. Marks the record for saving
    /// when the clause changed.
    pub fn set_primary_clause(&mut self, clause: SqlClause) {
        if self.clause.as_deref() != Some(clause.sql.as_str()) || self.params != clause.params {
            self.clause = Some(clause.sql);
            self.params = clause.params;
            self.is_new = true;
        }
    }

    /// Human readable binding, used in conflict errors.
    pub fn binding(&self) -> String {
        match (&self.table, &self.query) {
            (Some(_), Some(query)) => format!("query '{}'", query.key()),
            (Some(table), None) => format!("table '{}'", table),
            (None, _) => "the default table".to_string(),
        }
    }

    /// Merge a request's metadata into the persisted record.
    ///
    /// A different table or filter is a client error. A changed expire
    /// policy or persistence flag marks the record for re-saving.
    pub fn reconcile(mut self, requested: &KeyInfo, key: &str) -> Result<KeyInfo> {
        if let Some(table) = &requested.table {
            if self.table.as_ref() != Some(table) {
                return Err(Error::BindingConflict {
                    key: key.to_string(),
                    established: self.binding(),
                    requested: requested.binding(),
                });
            }
        }

        if let Some(query) = &requested.query {
            match &self.query {
                Some(existing) if existing.key() != query.key() => {
                    return Err(Error::BindingConflict {
                        key: key.to_string(),
                        established: self.binding(),
                        requested: requested.binding(),
                    });
                }
                Some(_) => {}
                None if self.clause.is_none() => {
                    self.query = Some(query.clone());
                    self.is_new = true;
                }
                None => {}
            }
        }

        if !requested.expire.is_empty() && requested.expire != self.expire {
            self.expire = requested.expire.clone();
            self.is_new = true;
        }

        if requested.no_db && !self.no_db {
            self.no_db = true;
            self.is_new = true;
        }

        Ok(self)
    }
}

/// Routing metadata for a batch, index-aligned with its [`KvPairs`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnyKey(Vec<KeyInfo>);

impl AnyKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same metadata for every pair of a batch.
    pub fn uniform(info: KeyInfo, count: usize) -> Self {
        Self(vec![info; count])
    }

    /// Fail unless there is exactly one record per pair.
    pub fn ensure_aligned(&self, pairs: &KvPairs) -> Result<()> {
        if self.0.len() != pairs.len() {
            return Err(Error::MissingInput(format!(
                "{} keys but {} routing records",
                pairs.len(),
                self.0.len()
            )));
        }
        Ok(())
    }

    pub fn into_inner(self) -> Vec<KeyInfo> {
        self.0
    }
}

impl From<Vec<KeyInfo>> for AnyKey {
    fn from(infos: Vec<KeyInfo>) -> Self {
        Self(infos)
    }
}

impl From<KeyInfo> for AnyKey {
    fn from(info: KeyInfo) -> Self {
        Self(vec![info])
    }
}

impl Deref for AnyKey {
    type Target = Vec<KeyInfo>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AnyKey {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::query::Operator;
    use crate::model::KvPair;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_routing_variants() {
        assert_eq!(KeyInfo::new().routing(), Routing::Unrouted);

        let mut info = KeyInfo::for_table("users");
        assert_matches!(info.routing(), Routing::Routed { table: "users", clause: None, .. });

        info.set_primary_clause(SqlClause {
            sql: "\"id\" = ?".into(),
            params: vec![json!(7)],
        });
        assert_matches!(
            info.routing(),
            Routing::Routed { clause: Some("\"id\" = ?"), params, .. }
                if params.len() == 1 && params[0] == json!(7)
        );
    }

    #[test]
    fn test_serialized_shape_skips_runtime_fields() {
        let mut info = KeyInfo::for_table("users").with_expire("30");
        info.indexes = vec!["id".into()];
        info.columns = vec!["id".into(), "name".into()];

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value, json!({"table": "users", "expire": "30"}));

        let back: KeyInfo = serde_json::from_value(value).unwrap();
        assert!(!back.is_new);
        assert!(back.indexes.is_empty());
    }

    #[test]
    fn test_reconcile_rejects_table_change() {
        let mut stored = KeyInfo::for_table("users");
        stored.is_new = false;

        let err = stored
            .clone()
            .reconcile(&KeyInfo::for_table("orders"), "k1")
            .unwrap_err();
        assert_matches!(err, Error::BindingConflict { .. });

        let err = KeyInfo::default()
            .reconcile(&KeyInfo::for_table("orders"), "k1")
            .unwrap_err();
        assert!(err.is_client_error());

        let same = stored.reconcile(&KeyInfo::for_table("users"), "k1").unwrap();
        assert!(!same.is_new);
    }

    #[test]
    fn test_reconcile_rejects_query_change() {
        let query = QueryInfo::new("users").when("name", Operator::Eq, "bob");
        let mut stored = KeyInfo::for_query(query.clone());
        stored.is_new = false;

        let other = KeyInfo::for_query(QueryInfo::new("users").when("name", Operator::Eq, "amy"));
        assert_matches!(
            stored.clone().reconcile(&other, "k"),
            Err(Error::BindingConflict { .. })
        );

        let same = stored.reconcile(&KeyInfo::for_query(query), "k").unwrap();
        assert!(!same.is_new);
    }

    #[test]
    fn test_reconcile_updates_expire() {
        let stored = KeyInfo {
            expire: "30".into(),
            ..Default::default()
        };

        let merged = stored
            .clone()
            .reconcile(&KeyInfo::new().with_expire("+60"), "k")
            .unwrap();
        assert_eq!(merged.expire, "+60");
        assert!(merged.is_new);

        let untouched = stored.reconcile(&KeyInfo::new(), "k").unwrap();
        assert_eq!(untouched.expire, "30");
        assert!(!untouched.is_new);
    }

    #[test]
    fn test_any_key_alignment() {
        let pairs = KvPairs::from(vec![KvPair::new("data", "a"), KvPair::new("data", "b")]);
        assert!(AnyKey::uniform(KeyInfo::new(), 2).ensure_aligned(&pairs).is_ok());
        assert_matches!(
            AnyKey::from(KeyInfo::new()).ensure_aligned(&pairs),
            Err(Error::MissingInput(_))
        );
    }
}
