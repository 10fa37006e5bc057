//! SQLite entity store.
//!
//! Each public method opens its own connection so callers never manage
//! connection lifetime, and concurrent caller threads share nothing but the
//! database file.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{RelQueryError, RelQueryResult};
use crate::models::{normalize_entity_type, StoredEntity};
use crate::query::builder::StructuredQuery;
use crate::store::{schema, EntityStore};

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

fn resolve_path(path: &Path) -> RelQueryResult<PathBuf> {
    let expanded = expand_tilde(&path.to_string_lossy());
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(&expanded)
    };
    if let Some(parent) = resolved.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(resolved)
}

const ENTITY_COLUMNS: &str = "entity_type, entity_id, attributes, metadata, searchable_content";

fn row_to_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEntity> {
    Ok(StoredEntity {
        entity_type: row.get(0)?,
        entity_id: row.get(1)?,
        attributes: row.get(2)?,
        metadata: row.get(3)?,
        searchable_content: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// SqliteEntityStore
// ---------------------------------------------------------------------------

pub struct SqliteEntityStore {
    db_path: PathBuf,
}

impl SqliteEntityStore {
    /// Resolve the path (creating parent directories) and initialise the schema.
    pub fn open(db_path: impl AsRef<Path>) -> RelQueryResult<Self> {
        let store = Self {
            db_path: resolve_path(db_path.as_ref())?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> RelQueryResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// WAL mode, replay-safe DDL, then pending migrations.
    pub fn init_schema(&self) -> RelQueryResult<()> {
        let conn = self.connect()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(&conn)?;
        Ok(())
    }

    pub fn schema_version(&self) -> RelQueryResult<i32> {
        Ok(schema::get_schema_version(&self.connect()?))
    }

    // -----------------------------------------------------------------------
    // Seeding (bootstrap and tests; the query engine never writes)
    // -----------------------------------------------------------------------

    /// Insert or replace one entity row as given, metadata text included.
    pub fn upsert_entity(&self, entity: &StoredEntity) -> RelQueryResult<()> {
        let entity_type = normalize_entity_type(&entity.entity_type);
        if entity_type.is_empty() || entity.entity_id.trim().is_empty() {
            return Err(RelQueryError::Store("entity type and id must not be blank".into()));
        }
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO entities(entity_type, entity_id, attributes, metadata, searchable_content) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET \
               attributes = excluded.attributes, \
               metadata = excluded.metadata, \
               searchable_content = excluded.searchable_content;",
            params![
                entity_type,
                entity.entity_id.trim(),
                entity.attributes,
                entity.metadata,
                entity.searchable_content
            ],
        )?;
        Ok(())
    }

    /// Convenience wrapper serializing JSON attributes and metadata.
    pub fn put_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        attributes: &serde_json::Value,
        metadata: Option<&serde_json::Value>,
        searchable_content: Option<&str>,
    ) -> RelQueryResult<()> {
        self.upsert_entity(&StoredEntity {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            attributes: Some(serde_json::to_string(attributes)?),
            metadata: metadata.map(serde_json::to_string).transpose()?,
            searchable_content: searchable_content.map(str::to_string),
        })
    }

    /// Record a relationship link. Both endpoints must already exist.
    pub fn link(
        &self,
        from_type: &str,
        from_id: &str,
        field_name: &str,
        to_type: &str,
        to_id: &str,
    ) -> RelQueryResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO relationships(from_type, from_id, field_name, to_type, to_id) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                normalize_entity_type(from_type),
                from_id,
                field_name.trim(),
                normalize_entity_type(to_type),
                to_id
            ],
        )?;
        Ok(())
    }

    pub fn count_entities(&self, entity_type: &str) -> RelQueryResult<i64> {
        let conn = self.connect()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE entity_type = ?1;",
            params![normalize_entity_type(entity_type)],
            |row| row.get(0),
        )?)
    }

    // -----------------------------------------------------------------------
    // Backup
    // -----------------------------------------------------------------------

    /// Copy the store to `destination` with the SQLite backup API.
    pub fn backup_to(&self, destination: impl AsRef<Path>) -> RelQueryResult<PathBuf> {
        let resolved = resolve_path(destination.as_ref())?;
        let src_conn = self.connect()?;
        let mut dst_conn = Connection::open(&resolved)?;
        let backup = rusqlite::backup::Backup::new(&src_conn, &mut dst_conn)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(10), None)?;
        Ok(resolved)
    }
}

impl EntityStore for SqliteEntityStore {
    fn execute_structured(&self, query: &StructuredQuery) -> RelQueryResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&query.sql)?;
        let limit = query.limit as i64;
        let mut named: Vec<(&str, &dyn rusqlite::types::ToSql)> = query
            .parameters
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::types::ToSql))
            .collect();
        named.push((":limit", &limit as &dyn rusqlite::types::ToSql));
        let rows = stmt.query_map(named.as_slice(), |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn scan_entities(&self, entity_type: &str, cap: usize) -> RelQueryResult<Vec<StoredEntity>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1 ORDER BY rowid LIMIT ?2;"
        ))?;
        let rows = stmt.query_map(
            params![normalize_entity_type(entity_type), cap as i64],
            row_to_entity,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn find_entity(&self, entity_type: &str, entity_id: &str) -> RelQueryResult<Option<StoredEntity>> {
        let conn = self.connect()?;
        let entity = conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1 AND entity_id = ?2;"),
                params![normalize_entity_type(entity_type), entity_id],
                row_to_entity,
            )
            .optional()?;
        Ok(entity)
    }

    fn keyword_candidates(
        &self,
        entity_type: &str,
        terms: &[String],
        cap: usize,
    ) -> RelQueryResult<Vec<StoredEntity>> {
        let conn = self.connect()?;
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(normalize_entity_type(entity_type))];
        let mut sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_type = ?1");
        if !terms.is_empty() {
            let mut clauses = Vec::with_capacity(terms.len());
            for term in terms {
                params.push(Box::new(format!("%{}%", term.to_lowercase())));
                clauses.push(format!("LOWER(COALESCE(searchable_content, '')) LIKE ?{}", params.len()));
            }
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        }
        params.push(Box::new(cap as i64));
        sql.push_str(&format!(" ORDER BY rowid LIMIT ?{};", params.len()));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), row_to_entity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
