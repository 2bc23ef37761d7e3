/// Typed convenience handle for one namespace
use super::operation::{
    DeleteResult, FindOptions, InsertResult, Namespace, Operation, OperationResult, UpdateResult,
};
use super::Executor;
use crate::error::{DriverError, DriverResult};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct Collection {
    executor: Arc<Executor>,
    namespace: Namespace,
}

impl Collection {
    pub fn new(executor: Arc<Executor>, namespace: Namespace) -> Self {
        Self { executor, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    async fn run(&self, operation: Operation) -> DriverResult<OperationResult> {
        self.executor.execute(&operation, None).await
    }

    /// Insert one document, returning its `_id`
    pub async fn insert_one(&self, document: Value) -> DriverResult<Value> {
        let result = self.insert(vec![document], true).await?;
        result
            .inserted_ids
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::internal("insert returned no id"))
    }

    pub async fn insert_many(
        &self,
        documents: Vec<Value>,
        ordered: bool,
    ) -> DriverResult<InsertResult> {
        self.insert(documents, ordered).await
    }

    async fn insert(&self, documents: Vec<Value>, ordered: bool) -> DriverResult<InsertResult> {
        let operation = Operation::Insert {
            namespace: self.namespace.clone(),
            documents,
            ordered,
        };
        match self.run(operation).await? {
            OperationResult::Insert(result) => Ok(result),
            other => Err(unexpected("insert", &other)),
        }
    }

    pub async fn find(&self, filter: Value, options: FindOptions) -> DriverResult<Vec<Value>> {
        let operation = Operation::Find {
            namespace: self.namespace.clone(),
            filter,
            options,
        };
        match self.run(operation).await? {
            OperationResult::Find(documents) => Ok(documents),
            other => Err(unexpected("find", &other)),
        }
    }

    pub async fn find_one(&self, filter: Value) -> DriverResult<Option<Value>> {
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self.find(filter, options).await?.into_iter().next())
    }

    pub async fn update_one(
        &self,
        filter: Value,
        update: Value,
        upsert: bool,
    ) -> DriverResult<UpdateResult> {
        self.update(filter, update, false, upsert).await
    }

    pub async fn update_many(
        &self,
        filter: Value,
        update: Value,
        upsert: bool,
    ) -> DriverResult<UpdateResult> {
        self.update(filter, update, true, upsert).await
    }

    async fn update(
        &self,
        filter: Value,
        update: Value,
        multi: bool,
        upsert: bool,
    ) -> DriverResult<UpdateResult> {
        let operation = Operation::Update {
            namespace: self.namespace.clone(),
            filter,
            update,
            multi,
            upsert,
        };
        match self.run(operation).await? {
            OperationResult::Update(result) => Ok(result),
            other => Err(unexpected("update", &other)),
        }
    }

    pub async fn delete_one(&self, filter: Value) -> DriverResult<DeleteResult> {
        self.delete(filter, false).await
    }

    pub async fn delete_many(&self, filter: Value) -> DriverResult<DeleteResult> {
        self.delete(filter, true).await
    }

    async fn delete(&self, filter: Value, multi: bool) -> DriverResult<DeleteResult> {
        let operation = Operation::Delete {
            namespace: self.namespace.clone(),
            filter,
            multi,
        };
        match self.run(operation).await? {
            OperationResult::Delete(result) => Ok(result),
            other => Err(unexpected("delete", &other)),
        }
    }

    pub async fn count_documents(&self, filter: Value) -> DriverResult<u64> {
        let operation = Operation::Count {
            namespace: self.namespace.clone(),
            filter,
        };
        match self.run(operation).await? {
            OperationResult::Count(count) => Ok(count),
            other => Err(unexpected("count", &other)),
        }
    }

    /// Create an index over `keys`, returning its name
    pub async fn create_index(&self, keys: Value, unique: bool) -> DriverResult<String> {
        let operation = Operation::CreateIndex {
            namespace: self.namespace.clone(),
            keys,
            unique,
            name: None,
        };
        match self.run(operation).await? {
            OperationResult::CreateIndex(name) => Ok(name),
            other => Err(unexpected("createIndexes", &other)),
        }
    }
}

fn unexpected(operation: &str, result: &OperationResult) -> DriverError {
    DriverError::internal(format!("{} produced unexpected result {:?}", operation, result))
}
