//! Credential loading and snapshot persistence against managed AWS stores.
//!
//! The destination table is torn down and rebuilt on every run; nothing is
//! diffed or merged. [`TableReplacer`] drives that lifecycle over the
//! [`TableStore`] seam so the eventual-consistency handling is testable with
//! an in-memory fake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType, PutRequest,
    ScalarAttributeType, SseSpecification, TableClass, TableStatus, WriteRequest,
};
use certsnap_core::{format_short_date, CertificationRecord, PortalCredentials};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "certsnap-store";

/// DynamoDB caps a single BatchWriteItem at 25 put requests.
pub const MAX_BATCH_PUT: usize = 25;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("secret {name} could not be retrieved: {message}")]
    Unavailable { name: String, message: String },
    #[error("secret {name} is not a username/password document: {message}")]
    Malformed { name: String, message: String },
}

/// Supplies the portal login pair. The pipeline never writes secrets.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch_credentials(&self) -> Result<PortalCredentials, CredentialError>;
}

/// Reads a `{Username, Password}` JSON document from Secrets Manager.
pub struct SecretsManagerCredentials {
    client: aws_sdk_secretsmanager::Client,
    secret_name: String,
}

impl SecretsManagerCredentials {
    pub fn new(client: aws_sdk_secretsmanager::Client, secret_name: impl Into<String>) -> Self {
        Self {
            client,
            secret_name: secret_name.into(),
        }
    }

    pub async fn from_env(secret_name: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_secretsmanager::Client::new(&config), secret_name)
    }
}

#[async_trait]
impl CredentialSource for SecretsManagerCredentials {
    async fn fetch_credentials(&self) -> Result<PortalCredentials, CredentialError> {
        debug!(secret = %self.secret_name, "loading portal credentials");
        let response = self
            .client
            .get_secret_value()
            .secret_id(&self.secret_name)
            .send()
            .await
            .map_err(|err| CredentialError::Unavailable {
                name: self.secret_name.clone(),
                message: err.into_service_error().to_string(),
            })?;

        let payload = response
            .secret_string()
            .ok_or_else(|| CredentialError::Malformed {
                name: self.secret_name.clone(),
                message: "secret has no string payload".to_string(),
            })?;

        serde_json::from_str(payload).map_err(|err| CredentialError::Malformed {
            name: self.secret_name.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table store request failed: {0}")]
    Request(String),
    #[error("invalid table request: {0}")]
    InvalidRequest(String),
}

/// Result of a delete request; a missing table is tolerated success, and
/// only that. Any other delete failure is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Absent,
    Creating,
    Active,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    pub unprocessed: usize,
}

/// Fixed composite key for the snapshot table: partition on the holder's
/// email, sort on the certificate name, both strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableKeySchema {
    pub partition_key: &'static str,
    pub sort_key: &'static str,
}

pub const CERTIFICATION_KEY_SCHEMA: TableKeySchema = TableKeySchema {
    partition_key: "Email",
    sort_key: "Cert",
};

/// Destination table operations as consumed by the replacer.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn delete_table(&self, table: &str) -> Result<DeleteOutcome, StoreError>;

    async fn create_table(&self, table: &str, schema: &TableKeySchema) -> Result<(), StoreError>;

    async fn table_state(&self, table: &str) -> Result<TableState, StoreError>;

    /// Upsert a batch of records; reports how many the store left unwritten.
    async fn put_batch(
        &self,
        table: &str,
        records: &[CertificationRecord],
    ) -> Result<PutOutcome, StoreError>;
}

/// Bounded polling against the store's eventual-consistency window.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error("table {table} did not reach {target:?} within {timeout:?}")]
    TransitionTimeout {
        table: String,
        target: TableState,
        timeout: Duration,
    },
    #[error("bulk write to {table} left {unprocessed} records unwritten")]
    BulkWrite { table: String, unprocessed: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle phases of one snapshot replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePhase {
    RemovePrevious,
    AwaitRemoval,
    CreateFresh,
    AwaitCreation,
    Write,
}

/// Replaces the destination table wholesale: delete (tolerating absence),
/// wait until confirmed gone, recreate with the fixed key schema, wait until
/// active, then bulk-write every record.
pub struct TableReplacer {
    store: Arc<dyn TableStore>,
    table_name: String,
    wait: WaitPolicy,
}

impl TableReplacer {
    pub fn new(store: Arc<dyn TableStore>, table_name: impl Into<String>, wait: WaitPolicy) -> Self {
        Self {
            store,
            table_name: table_name.into(),
            wait,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub async fn replace_all(&self, records: &[CertificationRecord]) -> Result<usize, ReplaceError> {
        let mut phase = ReplacePhase::RemovePrevious;
        while phase != ReplacePhase::Write {
            phase = self.advance(phase).await?;
        }
        self.write_records(records).await
    }

    async fn advance(&self, phase: ReplacePhase) -> Result<ReplacePhase, ReplaceError> {
        match phase {
            ReplacePhase::RemovePrevious => {
                info!(table = %self.table_name, "removing previous snapshot table");
                match self.store.delete_table(&self.table_name).await? {
                    DeleteOutcome::Deleted => {}
                    DeleteOutcome::NotFound => {
                        info!(table = %self.table_name, "table does not exist, skipping delete");
                    }
                }
                Ok(ReplacePhase::AwaitRemoval)
            }
            ReplacePhase::AwaitRemoval => {
                self.await_state(TableState::Absent).await?;
                Ok(ReplacePhase::CreateFresh)
            }
            ReplacePhase::CreateFresh => {
                info!(table = %self.table_name, "creating snapshot table");
                self.store
                    .create_table(&self.table_name, &CERTIFICATION_KEY_SCHEMA)
                    .await?;
                Ok(ReplacePhase::AwaitCreation)
            }
            ReplacePhase::AwaitCreation => {
                self.await_state(TableState::Active).await?;
                Ok(ReplacePhase::Write)
            }
            ReplacePhase::Write => Ok(ReplacePhase::Write),
        }
    }

    async fn await_state(&self, target: TableState) -> Result<(), ReplaceError> {
        let mut waited = Duration::ZERO;
        loop {
            if self.store.table_state(&self.table_name).await? == target {
                return Ok(());
            }
            if waited >= self.wait.timeout {
                return Err(ReplaceError::TransitionTimeout {
                    table: self.table_name.clone(),
                    target,
                    timeout: self.wait.timeout,
                });
            }
            sleep(self.wait.poll_interval).await;
            waited += self.wait.poll_interval;
        }
    }

    async fn write_records(&self, records: &[CertificationRecord]) -> Result<usize, ReplaceError> {
        info!(table = %self.table_name, count = records.len(), "saving certification data");
        let mut written = 0usize;
        for chunk in records.chunks(MAX_BATCH_PUT) {
            let outcome = self.store.put_batch(&self.table_name, chunk).await?;
            if outcome.unprocessed > 0 {
                return Err(ReplaceError::BulkWrite {
                    table: self.table_name.clone(),
                    unprocessed: outcome.unprocessed,
                });
            }
            written += chunk.len();
        }
        Ok(written)
    }
}

/// DynamoDB-backed [`TableStore`].
pub struct DynamoTableStore {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoTableStore {
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_dynamodb::Client::new(&config))
    }
}

fn record_item(record: &CertificationRecord) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::new();
    item.insert(
        "Email".to_string(),
        AttributeValue::S(record.email.clone()),
    );
    item.insert(
        "Cert".to_string(),
        AttributeValue::S(record.certificate_name.clone()),
    );
    item.insert(
        "AwardDate".to_string(),
        AttributeValue::S(format_short_date(record.award_date)),
    );
    item.insert(
        "User".to_string(),
        AttributeValue::S(record.user_name.clone()),
    );
    item.insert(
        "ExpirationDate".to_string(),
        AttributeValue::S(format_short_date(record.expiration_date)),
    );
    item.insert(
        "Level".to_string(),
        AttributeValue::S(record.certificate_level.clone()),
    );
    item.insert(
        "RecertDate".to_string(),
        AttributeValue::S(
            record
                .recertification_date
                .map(format_short_date)
                .unwrap_or_default(),
        ),
    );
    item.insert(
        "Recertified".to_string(),
        AttributeValue::S(record.status.as_str().to_string()),
    );
    item.insert(
        "LastCertDate".to_string(),
        AttributeValue::S(format_short_date(record.last_certification_date)),
    );
    item
}

#[async_trait]
impl TableStore for DynamoTableStore {
    async fn delete_table(&self, table: &str) -> Result<DeleteOutcome, StoreError> {
        match self.client.delete_table().table_name(table).send().await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_resource_not_found_exception() {
                    Ok(DeleteOutcome::NotFound)
                } else {
                    Err(StoreError::Request(format!(
                        "delete table {table}: {service}"
                    )))
                }
            }
        }
    }

    async fn create_table(&self, table: &str, schema: &TableKeySchema) -> Result<(), StoreError> {
        let key_element = |name: &'static str, key_type: KeyType| {
            KeySchemaElement::builder()
                .attribute_name(name)
                .key_type(key_type)
                .build()
                .map_err(|err| StoreError::InvalidRequest(err.to_string()))
        };
        let string_attribute = |name: &'static str| {
            AttributeDefinition::builder()
                .attribute_name(name)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(|err| StoreError::InvalidRequest(err.to_string()))
        };

        self.client
            .create_table()
            .table_name(table)
            .key_schema(key_element(schema.partition_key, KeyType::Hash)?)
            .key_schema(key_element(schema.sort_key, KeyType::Range)?)
            .attribute_definitions(string_attribute(schema.partition_key)?)
            .attribute_definitions(string_attribute(schema.sort_key)?)
            .billing_mode(BillingMode::PayPerRequest)
            .table_class(TableClass::StandardInfrequentAccess)
            .sse_specification(SseSpecification::builder().enabled(true).build())
            .send()
            .await
            .map_err(|err| {
                StoreError::Request(format!(
                    "create table {table}: {}",
                    err.into_service_error()
                ))
            })?;
        Ok(())
    }

    async fn table_state(&self, table: &str) -> Result<TableState, StoreError> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(output) => {
                let status = output.table().and_then(|t| t.table_status()).cloned();
                Ok(match status {
                    Some(TableStatus::Active) | Some(TableStatus::Updating) => TableState::Active,
                    Some(TableStatus::Creating) | None => TableState::Creating,
                    Some(_) => TableState::Deleting,
                })
            }
            Err(err) => {
                let service = err.into_service_error();
                if service.is_resource_not_found_exception() {
                    Ok(TableState::Absent)
                } else {
                    Err(StoreError::Request(format!(
                        "describe table {table}: {service}"
                    )))
                }
            }
        }
    }

    async fn put_batch(
        &self,
        table: &str,
        records: &[CertificationRecord],
    ) -> Result<PutOutcome, StoreError> {
        let mut requests = Vec::with_capacity(records.len());
        for record in records {
            let put = PutRequest::builder()
                .set_item(Some(record_item(record)))
                .build()
                .map_err(|err| StoreError::InvalidRequest(err.to_string()))?;
            requests.push(WriteRequest::builder().put_request(put).build());
        }

        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|err| {
                StoreError::Request(format!(
                    "batch write to {table}: {}",
                    err.into_service_error()
                ))
            })?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|items| items.get(table))
            .map(|requests| requests.len())
            .unwrap_or(0);
        Ok(PutOutcome { unprocessed })
    }
}
