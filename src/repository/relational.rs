//! Relational tier repository
//!
//! Routed keys map to one row of a named table, located by the cached
//! primary-key clause, else the binding filter, else a single-column key
//! matched against the key id. Unrouted keys, routing records and trace
//! records live in the default `(id, type, value)` table.
//!
//! When a table operation fails with a schema or SQL error and fallback is
//! enabled, the pair is served from the default table instead.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::domain::{EventPublisher, SqlExecutor, Tier, TierEvent};
use crate::error::{Error, Result};
use crate::local::{CacheService, RefreshFn};
use crate::metrics::EngineMetrics;
use crate::model::{Context, FieldMap, KeyInfo, KvPair, Routing, DEFAULT_FIELD};
use crate::sql::{check_identifier, diff_fields, QueryBuilder, SqlClause, TableMeta};

/// Reads and writes against the relational store.
pub struct RelationalRepository {
    sql: Arc<dyn SqlExecutor>,
    builder: QueryBuilder,
    cache: Arc<CacheService>,
    default_table: String,
    fallback: bool,
    metrics: Arc<EngineMetrics>,
    events: Arc<dyn EventPublisher>,
}

impl RelationalRepository {
    pub fn new(
        sql: Arc<dyn SqlExecutor>,
        cache: Arc<CacheService>,
        metrics: Arc<EngineMetrics>,
        events: Arc<dyn EventPublisher>,
        default_table: impl Into<String>,
        fallback: bool,
    ) -> Self {
        Self {
            builder: QueryBuilder::new(sql.dialect()),
            sql,
            cache,
            default_table: default_table.into(),
            fallback,
            metrics,
            events,
        }
    }

    pub fn default_table(&self) -> &str {
        &self.default_table
    }

    /// Create the default table if needed.
    pub async fn init(&self) -> Result<()> {
        let statement = self.builder.create_default_table(&self.default_table)?;
        self.sql.execute(&statement).await?;
        info!(table = %self.default_table, "Default table ready");
        Ok(())
    }

    // =========================================================================
    // Default Table Records
    // =========================================================================

    /// Read the decoded `value` column of a default-table record.
    pub async fn load_record(&self, kind: &str, id: &str) -> Result<Option<Value>> {
        let statement = self.builder.default_select(&self.default_table, id, kind)?;
        let row = self.sql.query(&statement).await?.into_iter().next();

        Ok(row
            .and_then(|mut row| row.remove("value"))
            .map(|value| match value {
                Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                other => other,
            }))
    }

    pub async fn store_record(&self, kind: &str, id: &str, value: &Value) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let statement = self
            .builder
            .default_upsert(&self.default_table, id, kind, encoded)?;
        self.sql.execute(&statement).await?;
        Ok(())
    }

    pub async fn remove_record(&self, kind: &str, id: &str) -> Result<bool> {
        let statement = self.builder.default_delete(&self.default_table, id, kind)?;
        Ok(self.sql.execute(&statement).await?.affected > 0)
    }

    async fn find_default(&self, pair: &mut KvPair) -> Result<bool> {
        match self.load_record(&pair.kind, &pair.id).await? {
            Some(Value::Object(fields)) => {
                pair.data = fields;
                self.metrics.hit(Tier::Relational);
                Ok(true)
            }
            Some(other) => {
                pair.data = FieldMap::new();
                pair.data.insert(DEFAULT_FIELD.to_string(), other);
                self.metrics.hit(Tier::Relational);
                Ok(true)
            }
            None => {
                self.metrics.miss(Tier::Relational);
                Ok(false)
            }
        }
    }

    /// Lay the fields of a default-table record over a table row.
    async fn overlay_default(&self, pair: &mut KvPair) -> Result<()> {
        if let Some(Value::Object(fields)) = self.load_record(&pair.kind, &pair.id).await? {
            pair.merge(&fields);
        }
        Ok(())
    }

    async fn store_default(&self, pair: &KvPair) -> Result<()> {
        self.store_record(&pair.kind, &pair.id, &Value::Object(pair.data.clone()))
            .await
    }

    /// Merge into an existing record. Returns false if there was none.
    async fn update_default(&self, pair: &mut KvPair) -> Result<bool> {
        let mut current = KvPair::new(pair.kind.clone(), pair.id.clone());
        if !self.find_default(&mut current).await? {
            return Ok(false);
        }
        current.merge(&pair.data);
        self.store_default(&current).await?;
        pair.data = current.data;
        Ok(true)
    }

    /// Update a routed key whose table rejected the write.
    ///
    /// The submitted fields are merged over the default-table record, or
    /// over the table row when there is no record yet, and the result is
    /// stored in the default table. Returns false if neither has the key.
    async fn update_fallback(
        &self,
        table: &str,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<bool> {
        if self.update_default(pair).await? {
            return Ok(true);
        }

        let row = match self.select_row(table, pair, info).await {
            Ok(row) => row,
            Err(e) => {
                debug!(key = %pair.cache_key(), "No table row to merge: {}", e);
                None
            }
        };
        let Some(row) = row else {
            return Ok(false);
        };

        let submitted = std::mem::replace(&mut pair.data, row);
        pair.merge(&submitted);
        self.store_default(pair).await?;
        Ok(true)
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Schema of a table, cached locally and refreshed ahead of expiry.
    pub async fn table_meta(&self, table: &str) -> Result<Arc<TableMeta>> {
        if let Some(meta) = self.cache.tables().get(table).await {
            return Ok(meta);
        }

        check_identifier(table)?;
        let meta = self
            .sql
            .table_meta(table)
            .await?
            .map(Arc::new)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))?;

        debug!(table, columns = meta.columns.len(), "Loaded table schema");
        self.cache
            .tables()
            .put_with_refresh(table, Arc::clone(&meta), self.schema_refresh(table));
        Ok(meta)
    }

    fn schema_refresh(&self, table: &str) -> RefreshFn<Arc<TableMeta>> {
        let sql = Arc::clone(&self.sql);
        let table = table.to_string();
        Arc::new(move || {
            let sql = Arc::clone(&sql);
            let table = table.clone();
            async move {
                sql.table_meta(&table)
                    .await?
                    .map(Arc::new)
                    .ok_or(Error::UnknownTable(table))
            }
            .boxed()
        })
    }

    /// Load a table's schema into `info` and reject fields it lacks.
    async fn bind(
        &self,
        table: &str,
        info: &mut KeyInfo,
        fields: &FieldMap,
    ) -> Result<Arc<TableMeta>> {
        let meta = self.table_meta(table).await?;
        info.indexes = meta.key_columns();
        info.columns = meta.column_names();

        let unknown = meta.unknown_fields(fields);
        if !unknown.is_empty() {
            return Err(Error::SchemaMismatch {
                table: table.to_string(),
                fields: unknown,
            });
        }
        Ok(meta)
    }

    /// Check a write against the table schema without touching any row.
    ///
    /// Fails only when the write could not succeed even with fallback.
    pub async fn validate(&self, pair: &KvPair, info: &mut KeyInfo) -> Result<()> {
        let Routing::Routed { table, .. } = info.routing() else {
            return Ok(());
        };
        let table = table.to_string();
        row_limit(info)?;

        match self.bind(&table, info, &pair.data).await {
            Err(e) if !(self.fallback && e.allows_fallback()) => Err(e),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Clause that locates the row of a routed key.
    fn locate(&self, pair: &KvPair, info: &KeyInfo) -> Result<SqlClause> {
        if let Some(clause) = info.primary_clause() {
            return Ok(clause);
        }
        if let Some(query) = &info.query {
            return self.builder.where_clause(&query.filter);
        }
        match info.indexes.as_slice() {
            [column] => self.builder.id_clause(column, &pair.id),
            _ => Err(Error::MissingInput(format!(
                "no filter to locate {} in its table",
                pair.cache_key()
            ))),
        }
    }

    /// Cache the row's primary-key clause once it is known.
    fn remember_row(&self, info: &mut KeyInfo, row: &FieldMap) -> Result<()> {
        if let Some(clause) = self.builder.primary_clause(&info.indexes, row)? {
            info.set_primary_clause(clause);
        }
        Ok(())
    }

    async fn select_row(
        &self,
        table: &str,
        pair: &KvPair,
        info: &mut KeyInfo,
    ) -> Result<Option<FieldMap>> {
        self.bind(table, info, &FieldMap::new()).await?;
        let clause = self.locate(pair, info)?;
        let statement = self.builder.select(table, &clause, Some(row_limit(info)?))?;
        let row = self.sql.query(&statement).await?.into_iter().next();

        if let Some(row) = &row {
            if info.clause.is_none() {
                self.remember_row(info, row)?;
            }
        }
        Ok(row)
    }

    async fn insert_row(&self, table: &str, pair: &mut KvPair, info: &mut KeyInfo) -> Result<()> {
        let meta = self.bind(table, info, &pair.data).await?;
        let statement = self.builder.insert(table, &pair.data)?;
        let executed = self.sql.execute(&statement).await?;

        if let (Some(column), Some(generated)) = (meta.auto_increment(), executed.last_insert_id) {
            if !pair.data.contains_key(column) {
                pair.data.insert(column.to_string(), Value::from(generated));
            }
        }
        self.remember_row(info, &pair.data)
    }

    /// Write the fields that differ from the stored row. Returns false if
    /// there is no row.
    async fn update_row(
        &self,
        table: &str,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<bool> {
        self.bind(table, info, &pair.data).await?;
        let clause = self.locate(pair, info)?;
        let statement = self.builder.select(table, &clause, Some(row_limit(info)?))?;
        let Some(mut row) = self.sql.query(&statement).await?.into_iter().next() else {
            return Ok(false);
        };
        if info.clause.is_none() {
            self.remember_row(info, &row)?;
        }

        let diff = diff_fields(&pair.data, &row);
        if diff.is_unchanged() {
            debug!(key = %pair.cache_key(), "Row already up to date");
            pair.data = row;
            return Ok(true);
        }

        let clause = info.primary_clause().unwrap_or(clause);
        let statement = self.builder.update(table, &diff.changes, &clause)?;
        self.sql.execute(&statement).await?;

        for (name, value) in diff.changes {
            row.insert(name, value);
        }
        self.remember_row(info, &row)?;
        pair.data = row;
        Ok(true)
    }

    async fn delete_row(&self, table: &str, pair: &KvPair, info: &mut KeyInfo) -> Result<bool> {
        self.bind(table, info, &FieldMap::new()).await?;
        let clause = self.locate(pair, info)?;
        let statement = self.builder.delete(table, &clause)?;
        Ok(self.sql.execute(&statement).await?.affected > 0)
    }

    /// Swallow a table error that the default table can absorb.
    async fn fall_back(&self, pair: &KvPair, table: &str, error: Error) -> Result<()> {
        if !(self.fallback && error.allows_fallback()) {
            return Err(error);
        }

        warn!(
            key = %pair.cache_key(),
            table,
            "Falling back to default table: {}",
            error
        );
        self.metrics.fallback();
        let event = TierEvent::fallback(pair.cache_key(), table, error.to_string());
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish fallback event: {}", e);
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Load a pair's row. Returns false if there is none.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn find(
        &self,
        ctx: &Context,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<bool> {
        let _stage = ctx.stage("relational.find");
        let Routing::Routed { table, .. } = info.routing() else {
            return self.find_default(pair).await;
        };
        let table = table.to_string();

        match self.select_row(&table, pair, info).await {
            Ok(Some(row)) => {
                pair.data = row;
                if self.fallback {
                    self.overlay_default(pair).await?;
                }
                self.metrics.hit(Tier::Relational);
                Ok(true)
            }
            // Rows written during a fallback live in the default table.
            Ok(None) if self.fallback => self.find_default(pair).await,
            Ok(None) => {
                self.metrics.miss(Tier::Relational);
                Ok(false)
            }
            Err(e) => {
                self.fall_back(pair, &table, e).await?;
                self.find_default(pair).await
            }
        }
    }

    /// Insert a new row, back-filling a generated key into the pair.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn insert(
        &self,
        ctx: &Context,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<()> {
        let _stage = ctx.stage("relational.insert");
        let Routing::Routed { table, .. } = info.routing() else {
            return self.store_default(pair).await;
        };
        let table = table.to_string();

        match self.insert_row(&table, pair, info).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fall_back(pair, &table, e).await?;
                self.store_default(pair).await
            }
        }
    }

    /// Apply submitted fields to an existing row. On success `pair.data`
    /// holds the full updated row. Returns false if there is no row.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn update(
        &self,
        ctx: &Context,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<bool> {
        let _stage = ctx.stage("relational.update");
        let Routing::Routed { table, .. } = info.routing() else {
            return self.update_default(pair).await;
        };
        let table = table.to_string();

        match self.update_row(&table, pair, info).await {
            Ok(false) if self.fallback => self.update_default(pair).await,
            Ok(updated) => Ok(updated),
            Err(e) => {
                self.fall_back(pair, &table, e).await?;
                self.update_fallback(&table, pair, info).await
            }
        }
    }

    /// Update the row if present, insert it otherwise.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn upsert(
        &self,
        ctx: &Context,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<()> {
        let _stage = ctx.stage("relational.upsert");
        let Routing::Routed { table, .. } = info.routing() else {
            return self.store_default(pair).await;
        };
        let table = table.to_string();

        let written = match self.update_row(&table, pair, info).await {
            Ok(true) => Ok(()),
            Ok(false) => self.insert_row(&table, pair, info).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fall_back(pair, &table, e).await?;
                self.store_default(pair).await
            }
        }
    }

    /// Delete a pair's row. Returns whether one was removed.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn delete(&self, ctx: &Context, pair: &KvPair, info: &mut KeyInfo) -> Result<bool> {
        let _stage = ctx.stage("relational.delete");
        let Routing::Routed { table, .. } = info.routing() else {
            return self.remove_record(&pair.kind, &pair.id).await;
        };
        let table = table.to_string();

        match self.delete_row(&table, pair, info).await {
            Ok(false) if self.fallback => self.remove_record(&pair.kind, &pair.id).await,
            Ok(deleted) => Ok(deleted),
            Err(e) => {
                self.fall_back(pair, &table, e).await?;
                self.remove_record(&pair.kind, &pair.id).await
            }
        }
    }
}

/// Rows a routed key may select. A key names exactly one row.
fn row_limit(info: &KeyInfo) -> Result<u32> {
    match info.query.as_ref().and_then(|query| query.limit) {
        None | Some(1) => Ok(1),
        Some(limit) => Err(Error::InvalidCondition {
            field: "limit".to_string(),
            reason: format!("a key maps to a single row, got limit {}", limit),
        }),
    }
}

impl std::fmt::Debug for RelationalRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalRepository")
            .field("default_table", &self.default_table)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
