//! In-memory backing store for the integration tests.
//!
//! Rows live in a [`MemoryDb`]; statement execution goes through a counting
//! [`MemoryConnection`] so tests can assert exactly how many round-trips a
//! query cost. The binding issues one statement per fetch and one per
//! prefetched relation hop; un-hinted relation traversal falls back to one
//! statement per parent record, which is the N+1 shape the prefetch engine
//! exists to avoid.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_graphql::Value;
use graphbind::{
    Connection, ConnectionRef, Filter, ModelBinding, Predicate, PrefetchPath, Record, RecordRef,
    Resolved, StoreError, TypeRegistry,
};
use parking_lot::RwLock;

pub type Row = BTreeMap<String, Value>;

/// How one named relation on a table is traversed.
#[derive(Clone)]
pub enum RelationDef {
    BelongsTo {
        target: &'static str,
        local_key: &'static str,
    },
    HasMany {
        target: &'static str,
        remote_key: &'static str,
    },
    ManyThrough {
        through: &'static str,
        through_local: &'static str,
        through_remote: &'static str,
        target: &'static str,
    },
}

#[derive(Default)]
pub struct MemoryDb {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    relations: RwLock<HashMap<(String, String), RelationDef>>,
}

impl MemoryDb {
    pub fn insert(&self, table: &str, row: Row) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    pub fn relation(&self, table: &str, name: &str, def: RelationDef) {
        self.relations
            .write()
            .insert((table.to_string(), name.to_string()), def);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    fn relation_def(&self, table: &str, name: &str) -> Option<RelationDef> {
        self.relations
            .read()
            .get(&(table.to_string(), name.to_string()))
            .cloned()
    }

    /// Rows reachable from `row` over `def`, straight from the tables.
    fn related_rows(&self, row: &Row, def: &RelationDef) -> (String, Vec<Row>) {
        match def {
            RelationDef::BelongsTo { target, local_key } => {
                let key = row.get(*local_key).cloned().unwrap_or(Value::Null);
                let rows = self
                    .rows(target)
                    .into_iter()
                    .filter(|r| r.get("id") == Some(&key))
                    .collect();
                (target.to_string(), rows)
            }
            RelationDef::HasMany { target, remote_key } => {
                let id = row.get("id").cloned().unwrap_or(Value::Null);
                let rows = self
                    .rows(target)
                    .into_iter()
                    .filter(|r| r.get(*remote_key) == Some(&id))
                    .collect();
                (target.to_string(), rows)
            }
            RelationDef::ManyThrough {
                through,
                through_local,
                through_remote,
                target,
            } => {
                let id = row.get("id").cloned().unwrap_or(Value::Null);
                let mut keys = Vec::new();
                for link in self.rows(through) {
                    if link.get(*through_local) == Some(&id) {
                        if let Some(remote) = link.get(*through_remote) {
                            if !keys.contains(remote) {
                                keys.push(remote.clone());
                            }
                        }
                    }
                }
                let rows = self
                    .rows(target)
                    .into_iter()
                    .filter(|r| r.get("id").is_some_and(|id| keys.contains(id)))
                    .collect();
                (target.to_string(), rows)
            }
        }
    }
}

// ============================================================================
// Records
// ============================================================================

pub struct MemRecord {
    db: Arc<MemoryDb>,
    conn: ConnectionRef,
    table: String,
    row: Row,
    cache: RwLock<HashMap<String, Vec<RecordRef>>>,
}

impl MemRecord {
    pub fn new(db: Arc<MemoryDb>, conn: ConnectionRef, table: &str, row: Row) -> Arc<Self> {
        Arc::new(MemRecord {
            db,
            conn,
            table: table.to_string(),
            row,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn db(&self) -> &Arc<MemoryDb> {
        &self.db
    }

    /// Wrap a row from another table with this record's connection.
    pub fn spawn(&self, table: &str, row: Row) -> RecordRef {
        MemRecord::new(self.db.clone(), self.conn.clone(), table, row)
    }

    fn cache_insert(&self, relation: &str, records: Vec<RecordRef>) {
        self.cache.write().insert(relation.to_string(), records);
    }

    fn cached(&self, relation: &str) -> Option<Vec<RecordRef>> {
        self.cache.read().get(relation).cloned()
    }

    /// Cache hit, or one fallback statement per call.
    fn load_relation(&self, name: &str) -> Result<Vec<RecordRef>, StoreError> {
        if let Some(records) = self.cached(name) {
            return Ok(records);
        }
        let def =
            self.db
                .relation_def(&self.table, name)
                .ok_or_else(|| StoreError::UnknownRelation {
                    record: self.table.clone(),
                    relation: name.to_string(),
                })?;
        self.conn.execute(
            &format!("SELECT * FROM {} WHERE ? /* relation {} */", self.table, name),
            &[self.row.get("id").cloned().unwrap_or(Value::Null)],
        )?;
        let (target, rows) = self.db.related_rows(&self.row, &def);
        Ok(rows
            .into_iter()
            .map(|row| self.spawn(&target, row))
            .collect())
    }
}

impl Record for MemRecord {
    fn attr(&self, name: &str) -> Option<Value> {
        self.row.get(name).cloned()
    }

    fn related_one(&self, name: &str) -> Result<Option<RecordRef>, StoreError> {
        Ok(self.load_relation(name)?.into_iter().next())
    }

    fn related_many(&self, name: &str) -> Result<Vec<RecordRef>, StoreError> {
        self.load_relation(name)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// ============================================================================
// Binding
// ============================================================================

pub struct MemoryBinding {
    db: Arc<MemoryDb>,
    table: String,
}

impl MemoryBinding {
    pub fn new(db: &Arc<MemoryDb>, table: &str) -> Arc<Self> {
        Arc::new(MemoryBinding {
            db: db.clone(),
            table: table.to_string(),
        })
    }
}

fn matches(row: &Row, predicate: &Predicate) -> bool {
    predicate.filters().iter().all(|filter| match filter {
        Filter::Eq { field, value } => row.get(field) == Some(value),
        Filter::In { field, values } => row.get(field).is_some_and(|v| values.contains(v)),
    })
}

fn predicate_sql(table: &str, predicate: &Predicate) -> (String, Vec<Value>) {
    if predicate.is_empty() {
        return (format!("SELECT * FROM {table}"), Vec::new());
    }
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for filter in predicate.filters() {
        match filter {
            Filter::Eq { field, value } => {
                clauses.push(format!("{field} = ?"));
                params.push(value.clone());
            }
            Filter::In { field, values } => {
                clauses.push(format!("{field} IN ?"));
                params.push(Value::List(values.clone()));
            }
        }
    }
    (
        format!("SELECT * FROM {table} WHERE {}", clauses.join(" AND ")),
        params,
    )
}

impl ModelBinding for MemoryBinding {
    fn get(
        &self,
        conn: &ConnectionRef,
        predicate: &Predicate,
    ) -> Result<Option<RecordRef>, StoreError> {
        let records = self.filter(conn, predicate)?;
        if records.len() > 1 {
            return Err(StoreError::MultipleResults {
                predicate: predicate.to_string(),
                found: records.len(),
            });
        }
        Ok(records.into_iter().next())
    }

    fn filter(
        &self,
        conn: &ConnectionRef,
        predicate: &Predicate,
    ) -> Result<Vec<RecordRef>, StoreError> {
        let (sql, params) = predicate_sql(&self.table, predicate);
        conn.execute(&sql, &params)?;
        Ok(self
            .db
            .rows(&self.table)
            .into_iter()
            .filter(|row| matches(row, predicate))
            .map(|row| MemRecord::new(self.db.clone(), conn.clone(), &self.table, row) as RecordRef)
            .collect())
    }

    fn prefetch_related(
        &self,
        conn: &ConnectionRef,
        records: Vec<RecordRef>,
        paths: &[PrefetchPath],
    ) -> Result<Vec<RecordRef>, StoreError> {
        let mut seen = HashSet::new();
        let deduped: Vec<PrefetchPath> = paths
            .iter()
            .filter(|p| seen.insert((*p).clone()))
            .cloned()
            .collect();
        prefetch_level(&self.db, conn, &records, &deduped)?;
        Ok(records)
    }
}

/// One bulk statement per relation hop: group the paths by head, load each
/// head relation for the whole collection, then recurse into the loaded
/// children with the path tails.
fn prefetch_level(
    db: &Arc<MemoryDb>,
    conn: &ConnectionRef,
    records: &[RecordRef],
    paths: &[PrefetchPath],
) -> Result<(), StoreError> {
    if records.is_empty() {
        return Ok(());
    }
    let mut grouped: Vec<(String, Vec<PrefetchPath>)> = Vec::new();
    for path in paths {
        let head = path.head().to_string();
        match grouped.iter_mut().find(|(h, _)| *h == head) {
            Some((_, tails)) => tails.extend(path.tail()),
            None => grouped.push((head, path.tail().into_iter().collect())),
        }
    }

    for (head, tails) in grouped {
        let mut children: Vec<RecordRef> = Vec::new();
        let mut table = None;
        // All parents share one table; a single bulk statement covers them.
        conn.execute(
            &format!("SELECT * FROM ? /* prefetch {head} */"),
            &[Value::from(records.len() as i64)],
        )?;
        for record in records {
            let Some(mem) = record.as_any().downcast_ref::<MemRecord>() else {
                return Err(StoreError::Backend("not a memory record".to_string()));
            };
            let def = db
                .relation_def(&mem.table, &head)
                .ok_or_else(|| StoreError::UnknownRelation {
                    record: mem.table.clone(),
                    relation: head.clone(),
                })?;
            let (target, rows) = db.related_rows(&mem.row, &def);
            table = Some(target.clone());
            let related: Vec<RecordRef> = rows
                .into_iter()
                .map(|row| mem.spawn(&target, row))
                .collect();
            children.extend(related.iter().cloned());
            mem.cache_insert(&head, related);
        }
        if !tails.is_empty() && table.is_some() {
            prefetch_level(db, conn, &children, &tails)?;
        }
    }
    Ok(())
}

// ============================================================================
// Connection
// ============================================================================

pub struct MemoryConnection {
    alias: String,
    calls: AtomicUsize,
}

impl MemoryConnection {
    pub fn new() -> Arc<Self> {
        Self::with_alias("default")
    }

    pub fn with_alias(alias: &str) -> Arc<Self> {
        Arc::new(MemoryConnection {
            alias: alias.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Connection for MemoryConnection {
    fn vendor(&self) -> &str {
        "memory"
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    fn execute(&self, _statement: &str, _params: &[Value]) -> Result<u64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

// ============================================================================
// Scenario
// ============================================================================

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Two containers, five items, and the movement history linking them:
/// items 1-4 sit in container_A; item_5 passed through container_A (its
/// movement has `left` set) and now sits in container_B.
pub fn seed_db() -> Arc<MemoryDb> {
    let db = Arc::new(MemoryDb::default());
    db.insert(
        "containers",
        row(&[("id", Value::from(1)), ("name", Value::from("container_A"))]),
    );
    db.insert(
        "containers",
        row(&[("id", Value::from(2)), ("name", Value::from("container_B"))]),
    );
    for i in 1..=5 {
        db.insert(
            "items",
            row(&[
                ("id", Value::from(i)),
                ("name", Value::from(format!("item_{i}"))),
            ]),
        );
    }
    for i in 1..=4 {
        db.insert(
            "movements",
            row(&[
                ("id", Value::from(i)),
                ("container", Value::from(1)),
                ("item", Value::from(i)),
                ("left", Value::Null),
            ]),
        );
    }
    db.insert(
        "movements",
        row(&[
            ("id", Value::from(5)),
            ("container", Value::from(1)),
            ("item", Value::from(5)),
            ("left", Value::from("2020-01-01T00:00:00Z")),
        ]),
    );
    db.insert(
        "movements",
        row(&[
            ("id", Value::from(6)),
            ("container", Value::from(2)),
            ("item", Value::from(5)),
            ("left", Value::Null),
        ]),
    );

    db.relation(
        "items",
        "containers",
        RelationDef::ManyThrough {
            through: "movements",
            through_local: "item",
            through_remote: "container",
            target: "containers",
        },
    );
    db.relation(
        "items",
        "movements",
        RelationDef::HasMany {
            target: "movements",
            remote_key: "item",
        },
    );
    db.relation(
        "containers",
        "items",
        RelationDef::ManyThrough {
            through: "movements",
            through_local: "container",
            through_remote: "item",
            target: "items",
        },
    );
    db.relation(
        "containers",
        "movements",
        RelationDef::HasMany {
            target: "movements",
            remote_key: "container",
        },
    );
    db.relation(
        "movements",
        "item",
        RelationDef::BelongsTo {
            target: "items",
            local_key: "item",
        },
    );
    db.relation(
        "movements",
        "container",
        RelationDef::BelongsTo {
            target: "containers",
            local_key: "container",
        },
    );
    db
}

fn as_mem(record: &dyn Record) -> Result<&MemRecord, StoreError> {
    record
        .as_any()
        .downcast_ref::<MemRecord>()
        .ok_or_else(|| StoreError::Backend("not a memory record".to_string()))
}

/// Open movements (no `left` timestamp) for a record, keyed by `key`.
fn open_movements(mem: &MemRecord, key: &str) -> Vec<Row> {
    let id = mem.row().get("id").cloned().unwrap_or(Value::Null);
    mem.db()
        .rows("movements")
        .into_iter()
        .filter(|m| m.get(key) == Some(&id) && m.get("left") == Some(&Value::Null))
        .collect()
}

fn rows_by_id(db: &MemoryDb, table: &str, ids: &[Value]) -> Vec<Row> {
    db.rows(table)
        .into_iter()
        .filter(|r| r.get("id").is_some_and(|id| ids.contains(id)))
        .collect()
}

/// The container/item/movement registry the integration tests query.
/// `Container` is declared first and refers to `Item` before it exists;
/// only schema assembly resolves the reference.
pub fn scenario(db: &Arc<MemoryDb>) -> TypeRegistry {
    let t = TypeRegistry::new();
    t.declare("Container")
        .description("A storage container and its item history.")
        .field("id", t.type_ref("Int"))
        .field("name", t.type_ref("String"))
        .field("items", t.type_ref("Item").list())
        .field("current_items", t.type_ref("Item").list())
        .prefetch("items", ["items"])
        .prefetch("current_items", ["items"])
        .resolve_with("current_items", |record| {
            let mem = as_mem(record)?;
            let ids: Vec<Value> = open_movements(mem, "container")
                .iter()
                .filter_map(|m| m.get("item").cloned())
                .collect();
            Ok(Resolved::Many(
                rows_by_id(mem.db(), "items", &ids)
                    .into_iter()
                    .map(|row| mem.spawn("items", row))
                    .collect(),
            ))
        })
        .filterable(["id", "name"])
        .bind(MemoryBinding::new(db, "containers"))
        .register()
        .unwrap();

    t.declare("Item")
        .field("id", t.type_ref("Int"))
        .field("name", t.type_ref("String"))
        .field("containers", t.type_ref("Container").list())
        .field("current_container", t.type_ref("Container"))
        .prefetch("containers", ["containers"])
        .prefetch("current_container", ["containers"])
        .resolve_with("current_container", |record| {
            let mem = as_mem(record)?;
            let ids: Vec<Value> = open_movements(mem, "item")
                .iter()
                .filter_map(|m| m.get("container").cloned())
                .collect();
            Ok(Resolved::One(
                rows_by_id(mem.db(), "containers", &ids)
                    .into_iter()
                    .next()
                    .map(|row| mem.spawn("containers", row)),
            ))
        })
        .filterable(["id", "name"])
        .bind(MemoryBinding::new(db, "items"))
        .register()
        .unwrap();

    t.declare("ItemMovement")
        .field("id", t.type_ref("Int"))
        .field("item", t.type_ref("Item"))
        .field("container", t.type_ref("Container"))
        .filterable(["id"])
        .bind(MemoryBinding::new(db, "movements"))
        .register()
        .unwrap();
    t
}

/// Same shape as [`scenario`] but with no prefetch hints: nested selections
/// fall back to one statement per parent record.
pub fn scenario_without_hints(db: &Arc<MemoryDb>) -> TypeRegistry {
    let t = TypeRegistry::new();
    t.declare("Container")
        .field("id", t.type_ref("Int"))
        .field("name", t.type_ref("String"))
        .register()
        .unwrap();
    t.declare("Item")
        .field("id", t.type_ref("Int"))
        .field("name", t.type_ref("String"))
        .field("containers", t.type_ref("Container").list())
        .filterable(["id", "name"])
        .bind(MemoryBinding::new(db, "items"))
        .register()
        .unwrap();
    t
}
