/// Logical operations, the command documents they become, and typed results
use crate::error::{DriverError, DriverResult, ServerError};
use crate::topology::{ReadPreference, SelectionCriteria};
use crate::utils::generate_object_id;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// Server code used when a failed reply carries no code of its own
const UNKNOWN_ERROR_CODE: i32 = 8;

/// Database plus collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new<D: Into<String>, C: Into<String>>(database: D, collection: C) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl FromStr for Namespace {
    type Err = DriverError;

    /// Parse `db.collection`; the collection part may itself contain dots
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((database, collection))
                if !database.is_empty() && !collection.is_empty() && !database.contains(' ') =>
            {
                Ok(Namespace::new(database, collection))
            }
            _ => Err(DriverError::invalid_argument(format!(
                "invalid namespace '{}', expected 'database.collection'",
                s
            ))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Options for `find`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Value>,
    pub sort: Option<Value>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
}

/// Whether an operation may be attempted a second time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Safe to repeat
    Idempotent,
    /// Only if the first attempt never reached the wire
    UnattemptedOnly,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Find,
    Update,
    Delete,
    Count,
    CreateIndex,
    Command,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Find => "find",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Count => "count",
            OperationKind::CreateIndex => "createIndexes",
            OperationKind::Command => "command",
        };
        write!(f, "{}", name)
    }
}

/// One logical request against the database
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        namespace: Namespace,
        documents: Vec<Value>,
        ordered: bool,
    },
    Find {
        namespace: Namespace,
        filter: Value,
        options: FindOptions,
    },
    Update {
        namespace: Namespace,
        filter: Value,
        update: Value,
        multi: bool,
        upsert: bool,
    },
    Delete {
        namespace: Namespace,
        filter: Value,
        multi: bool,
    },
    Count {
        namespace: Namespace,
        filter: Value,
    },
    CreateIndex {
        namespace: Namespace,
        /// Ordered `{field: 1 | -1}` document
        keys: Value,
        unique: bool,
        name: Option<String>,
    },
    /// Raw command run against `database`; retried only when marked retryable
    Command {
        database: String,
        command: Value,
        retryable: bool,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Find { .. } => OperationKind::Find,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::Count { .. } => OperationKind::Count,
            Operation::CreateIndex { .. } => OperationKind::CreateIndex,
            Operation::Command { .. } => OperationKind::Command,
        }
    }

    /// A single-document write carries a client-chosen identity and can be
    /// repeated; a multi-document write may have partially applied.
    pub fn retryability(&self) -> Retryability {
        match self {
            Operation::Insert { documents, .. } if documents.len() <= 1 => Retryability::Idempotent,
            Operation::Insert { .. } => Retryability::UnattemptedOnly,
            Operation::Update { multi: true, .. } | Operation::Delete { multi: true, .. } => {
                Retryability::UnattemptedOnly
            }
            Operation::Update { .. } | Operation::Delete { .. } => Retryability::Idempotent,
            Operation::Find { .. } | Operation::Count { .. } | Operation::CreateIndex { .. } => {
                Retryability::Idempotent
            }
            Operation::Command { retryable: true, .. } => Retryability::Idempotent,
            Operation::Command { .. } => Retryability::Never,
        }
    }

    pub fn selection_criteria(&self, read_preference: ReadPreference) -> SelectionCriteria {
        match self {
            Operation::Find { .. } | Operation::Count { .. } => {
                SelectionCriteria::Read(read_preference)
            }
            _ => SelectionCriteria::Write,
        }
    }

    /// Validate arguments and build the command document
    ///
    /// Inserted documents without an `_id` get one here, once, so every
    /// attempt sends identical documents.
    pub fn prepare(&self, operation_id: u64) -> DriverResult<PreparedOperation> {
        let mut inserted_ids = Vec::new();
        let mut index_name = None;

        let mut command = match self {
            Operation::Insert {
                namespace,
                documents,
                ordered,
            } => {
                if documents.is_empty() {
                    return Err(DriverError::invalid_argument(
                        "insert requires at least one document",
                    ));
                }
                let mut prepared = Vec::with_capacity(documents.len());
                for document in documents {
                    let document = with_id(document)?;
                    inserted_ids.push(document.get("_id").cloned().unwrap_or(Value::Null));
                    prepared.push(Value::Object(document));
                }
                json!({
                    "insert": namespace.collection,
                    "documents": prepared,
                    "ordered": ordered,
                    "$db": namespace.database,
                })
            }
            Operation::Find {
                namespace,
                filter,
                options,
            } => {
                let mut command = json!({
                    "find": namespace.collection,
                    "filter": require_document(filter, "filter")?,
                    "$db": namespace.database,
                });
                if let Some(projection) = &options.projection {
                    command["projection"] = require_document(projection, "projection")?;
                }
                if let Some(sort) = &options.sort {
                    command["sort"] = require_document(sort, "sort")?;
                }
                if let Some(skip) = options.skip {
                    command["skip"] = json!(skip);
                }
                if let Some(limit) = options.limit {
                    command["limit"] = json!(limit);
                }
                command
            }
            Operation::Update {
                namespace,
                filter,
                update,
                multi,
                upsert,
            } => {
                check_update_document(update)?;
                json!({
                    "update": namespace.collection,
                    "updates": [{
                        "q": require_document(filter, "filter")?,
                        "u": update,
                        "multi": multi,
                        "upsert": upsert,
                    }],
                    "ordered": true,
                    "$db": namespace.database,
                })
            }
            Operation::Delete {
                namespace,
                filter,
                multi,
            } => {
                // Zero removes every match
                let limit = if *multi { 0 } else { 1 };
                json!({
                    "delete": namespace.collection,
                    "deletes": [{
                        "q": require_document(filter, "filter")?,
                        "limit": limit,
                    }],
                    "ordered": true,
                    "$db": namespace.database,
                })
            }
            Operation::Count { namespace, filter } => json!({
                "count": namespace.collection,
                "query": require_document(filter, "filter")?,
                "$db": namespace.database,
            }),
            Operation::CreateIndex {
                namespace,
                keys,
                unique,
                name,
            } => {
                let keys = require_document(keys, "index keys")?;
                let name = match name {
                    Some(name) => name.clone(),
                    None => default_index_name(&keys)?,
                };
                index_name = Some(name.clone());
                json!({
                    "createIndexes": namespace.collection,
                    "indexes": [{ "key": keys, "name": name, "unique": unique }],
                    "$db": namespace.database,
                })
            }
            Operation::Command { database, command, .. } => {
                let mut command = require_document(command, "command")?;
                if command.as_object().map(Map::is_empty).unwrap_or(true) {
                    return Err(DriverError::invalid_argument("command document cannot be empty"));
                }
                command["$db"] = json!(database);
                command
            }
        };

        let is_write = matches!(
            self.kind(),
            OperationKind::Insert | OperationKind::Update | OperationKind::Delete
        );
        if is_write {
            command["operationId"] = json!(operation_id);
        }

        Ok(PreparedOperation {
            kind: self.kind(),
            command,
            inserted_ids,
            index_name,
        })
    }
}

fn require_document(value: &Value, what: &str) -> DriverResult<Value> {
    match value {
        Value::Object(_) => Ok(value.clone()),
        other => Err(DriverError::invalid_argument(format!(
            "{} must be a document, got {}",
            what, other
        ))),
    }
}

/// Copy of `document` with `_id` as its first field
fn with_id(document: &Value) -> DriverResult<Map<String, Value>> {
    let fields = document.as_object().ok_or_else(|| {
        DriverError::invalid_argument(format!("cannot insert non-document {}", document))
    })?;

    let mut prepared = Map::with_capacity(fields.len() + 1);
    let id = fields
        .get("_id")
        .cloned()
        .unwrap_or_else(|| Value::String(generate_object_id()));
    prepared.insert("_id".to_string(), id);
    for (key, value) in fields {
        if key != "_id" {
            prepared.insert(key.clone(), value.clone());
        }
    }
    Ok(prepared)
}

fn check_update_document(update: &Value) -> DriverResult<()> {
    let fields = update
        .as_object()
        .ok_or_else(|| DriverError::invalid_argument("update must be a document"))?;
    if fields.is_empty() {
        return Err(DriverError::invalid_argument("update document cannot be empty"));
    }
    if let Some(key) = fields.keys().find(|key| !key.starts_with('$')) {
        return Err(DriverError::invalid_argument(format!(
            "update document must contain only update operators, found '{}'",
            key
        )));
    }
    Ok(())
}

/// `{a: 1, b: -1}` becomes `a_1_b_-1`
fn default_index_name(keys: &Value) -> DriverResult<String> {
    let fields = keys.as_object().map(|m| m.iter()).into_iter().flatten();
    let mut parts = Vec::new();
    for (field, direction) in fields {
        let direction = match direction {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => {
                return Err(DriverError::invalid_argument(format!(
                    "invalid index direction {} for '{}'",
                    other, field
                )))
            }
        };
        parts.push(format!("{}_{}", field, direction));
    }
    if parts.is_empty() {
        return Err(DriverError::invalid_argument("index keys cannot be empty"));
    }
    Ok(parts.join("_"))
}

/// Command document plus what is needed to interpret the reply
#[derive(Debug, Clone)]
pub struct PreparedOperation {
    pub kind: OperationKind,
    pub command: Value,
    inserted_ids: Vec<Value>,
    index_name: Option<String>,
}

impl PreparedOperation {
    /// Turn a reply document into the operation's result
    pub fn to_result(&self, reply: Value) -> DriverResult<OperationResult> {
        let parsed = CommandReply::parse(&reply)?;

        match self.kind {
            OperationKind::Insert => Ok(OperationResult::Insert(InsertResult {
                inserted_count: parsed.n.unwrap_or(self.inserted_ids.len() as u64),
                inserted_ids: self.inserted_ids.clone(),
            })),
            OperationKind::Find => {
                let documents = parsed.cursor.map(|c| c.first_batch).unwrap_or_default();
                Ok(OperationResult::Find(documents))
            }
            OperationKind::Update => {
                let upserted_id = parsed.upserted.into_iter().next().map(|u| u.id);
                let upserted = u64::from(upserted_id.is_some());
                Ok(OperationResult::Update(UpdateResult {
                    matched_count: parsed.n.unwrap_or(0).saturating_sub(upserted),
                    modified_count: parsed.n_modified.unwrap_or(0),
                    upserted_id,
                }))
            }
            OperationKind::Delete => Ok(OperationResult::Delete(DeleteResult {
                deleted_count: parsed.n.unwrap_or(0),
            })),
            OperationKind::Count => Ok(OperationResult::Count(parsed.n.unwrap_or(0))),
            OperationKind::CreateIndex => Ok(OperationResult::CreateIndex(
                self.index_name.clone().unwrap_or_default(),
            )),
            OperationKind::Command => Ok(OperationResult::Command(reply)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Upserted {
    #[serde(rename = "_id")]
    id: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteError {
    code: i32,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Cursor {
    #[serde(default)]
    first_batch: Vec<Value>,
}

/// Fields common to command replies
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandReply {
    ok: f64,
    #[serde(default)]
    n: Option<u64>,
    #[serde(default)]
    n_modified: Option<u64>,
    #[serde(default)]
    upserted: Vec<Upserted>,
    #[serde(default)]
    write_errors: Vec<WriteError>,
    #[serde(default)]
    cursor: Option<Cursor>,
    #[serde(default)]
    code: Option<i32>,
    #[serde(default)]
    code_name: Option<String>,
    #[serde(default)]
    errmsg: Option<String>,
}

impl CommandReply {
    /// Parse a reply and surface server-reported failures as errors
    fn parse(reply: &Value) -> DriverResult<Self> {
        let parsed: CommandReply = serde_json::from_value(reply.clone())
            .map_err(|e| DriverError::encoding(format!("malformed reply: {}", e)))?;

        if parsed.ok != 1.0 {
            return Err(DriverError::Server(ServerError {
                code: parsed.code.unwrap_or(UNKNOWN_ERROR_CODE),
                code_name: parsed.code_name,
                message: parsed.errmsg.unwrap_or_else(|| "command failed".to_string()),
            }));
        }
        if let Some(error) = parsed.write_errors.first() {
            return Err(DriverError::Server(ServerError::new(error.code, error.errmsg.clone())));
        }
        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertResult {
    pub inserted_count: u64,
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Typed outcome of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Insert(InsertResult),
    Find(Vec<Value>),
    Update(UpdateResult),
    Delete(DeleteResult),
    Count(u64),
    CreateIndex(String),
    Command(Value),
}
