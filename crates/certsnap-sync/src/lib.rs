//! Snapshot pipeline orchestration: credentials -> cookies -> raw export ->
//! normalized records -> replaced table, strictly in that order, once per
//! trigger. Every stage failure propagates; the next scheduled run is the
//! only recovery mechanism.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use certsnap_core::normalize_report;
use certsnap_portal::{ExportFetcher, PortalAuthenticator, ReportSource, WebDriverAuthenticator};
use certsnap_store::{
    CredentialSource, DynamoTableStore, SecretsManagerCredentials, TableReplacer, WaitPolicy,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "certsnap-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub secret_name: String,
    pub table_name: String,
    pub login_url: String,
    pub export_url: String,
    pub webdriver_url: String,
    pub login_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub table_wait_timeout_secs: u64,
    pub table_poll_interval_secs: u64,
    pub sync_cron: String,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            secret_name: std::env::var("SECRET_NAME").unwrap_or_else(|_| "apn-portal".to_string()),
            table_name: std::env::var("CERT_TABLE_NAME")
                .unwrap_or_else(|_| "certifications".to_string()),
            login_url: std::env::var("CERTSNAP_LOGIN_URL")
                .unwrap_or_else(|_| "https://partnercentral.awspartner.com/APNLogin".to_string()),
            export_url: std::env::var("CERTSNAP_EXPORT_URL").unwrap_or_else(|_| {
                "https://partnercentral.awspartner.com/PartnerCertificationDetailsExport"
                    .to_string()
            }),
            webdriver_url: std::env::var("CERTSNAP_WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:9515".to_string()),
            login_timeout_secs: env_u64("CERTSNAP_LOGIN_TIMEOUT_SECS", 20),
            http_timeout_secs: env_u64("CERTSNAP_HTTP_TIMEOUT_SECS", 20),
            table_wait_timeout_secs: env_u64("CERTSNAP_TABLE_WAIT_TIMEOUT_SECS", 300),
            table_poll_interval_secs: env_u64("CERTSNAP_TABLE_POLL_INTERVAL_SECS", 5),
            sync_cron: std::env::var("CERTSNAP_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 20 * * *".to_string()),
            user_agent: std::env::var("CERTSNAP_USER_AGENT")
                .unwrap_or_else(|_| "certsnap/0.1".to_string()),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_written: usize,
}

impl SyncRunSummary {
    /// The run's externally observable result line.
    pub fn message(&self) -> String {
        format!("Found {} certifications...", self.records_written)
    }
}

/// One invocation's worth of pipeline, with every collaborator injected at
/// construction. No stage reads back from a later one.
pub struct SyncPipeline {
    credentials: Box<dyn CredentialSource>,
    authenticator: Box<dyn PortalAuthenticator>,
    report: Box<dyn ReportSource>,
    replacer: TableReplacer,
}

impl SyncPipeline {
    pub fn new(
        credentials: Box<dyn CredentialSource>,
        authenticator: Box<dyn PortalAuthenticator>,
        report: Box<dyn ReportSource>,
        replacer: TableReplacer,
    ) -> Self {
        Self {
            credentials,
            authenticator,
            report,
            replacer,
        }
    }

    /// Wire the real collaborators: Secrets Manager, a WebDriver session,
    /// the portal export endpoint, and DynamoDB.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let credentials = SecretsManagerCredentials::from_env(config.secret_name.clone()).await;
        let authenticator = WebDriverAuthenticator::new(
            config.webdriver_url.clone(),
            config.login_url.clone(),
            Duration::from_secs(config.login_timeout_secs),
        );
        let report = ExportFetcher::new(
            config.export_url.clone(),
            Duration::from_secs(config.http_timeout_secs),
            &config.user_agent,
        )
        .context("building export http client")?;
        let store = Arc::new(DynamoTableStore::from_env().await);
        let replacer = TableReplacer::new(
            store,
            config.table_name.clone(),
            WaitPolicy {
                timeout: Duration::from_secs(config.table_wait_timeout_secs),
                poll_interval: Duration::from_secs(config.table_poll_interval_secs),
            },
        );
        Ok(Self::new(
            Box::new(credentials),
            Box::new(authenticator),
            Box::new(report),
            replacer,
        ))
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, table = %self.replacer.table_name(), "starting certification snapshot run");

        let credentials = self
            .credentials
            .fetch_credentials()
            .await
            .context("loading portal credentials")?;
        let cookies = self
            .authenticator
            .authenticate(&credentials)
            .await
            .context("authenticating against the portal")?;
        let raw = self
            .report
            .fetch_report(&cookies)
            .await
            .context("downloading certification export")?;
        let records = normalize_report(&raw).context("normalizing certification export")?;
        info!(count = records.len(), "found certifications");

        let records_written = self
            .replacer
            .replace_all(&records)
            .await
            .context("replacing snapshot table")?;

        let finished_at = Utc::now();
        info!(%run_id, records_written, "certification snapshot run complete");
        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            records_written,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    pipeline.run_once().await
}

/// Scheduler hosting the daily trigger in-process, for deployments without
/// an external cron rule.
pub async fn build_scheduler(config: &SyncConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), |_uuid, _lock| {
        Box::pin(async move {
            match run_sync_once_from_env().await {
                Ok(summary) => {
                    info!(run_id = %summary.run_id, records = summary.records_written, "scheduled sync complete");
                }
                Err(err) => warn!(error = ?err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use certsnap_core::{CertificationRecord, PortalCredentials};
    use certsnap_portal::{AuthError, CookieJar, FetchError};
    use certsnap_store::{
        CredentialError, DeleteOutcome, PutOutcome, StoreError, TableKeySchema, TableState,
        TableStore,
    };
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct StaticCredentials;

    #[async_trait]
    impl CredentialSource for StaticCredentials {
        async fn fetch_credentials(&self) -> Result<PortalCredentials, CredentialError> {
            Ok(PortalCredentials {
                username: "partner@example.com".to_string(),
                password: "hunter2".to_string(),
            })
        }
    }

    struct CannedLogin;

    #[async_trait]
    impl PortalAuthenticator for CannedLogin {
        async fn authenticate(
            &self,
            credentials: &PortalCredentials,
        ) -> Result<CookieJar, AuthError> {
            assert_eq!(credentials.username, "partner@example.com");
            let mut jar = CookieJar::new();
            jar.insert("sid", "canned-session");
            Ok(jar)
        }
    }

    struct CannedReport(Vec<u8>);

    #[async_trait]
    impl ReportSource for CannedReport {
        async fn fetch_report(&self, cookies: &CookieJar) -> Result<Vec<u8>, FetchError> {
            assert!(!cookies.is_empty());
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct MemoryState {
        exists: bool,
        mutations: usize,
        items: BTreeMap<(String, String), CertificationRecord>,
    }

    #[derive(Default)]
    struct MemoryStore {
        state: Mutex<MemoryState>,
    }

    #[async_trait]
    impl TableStore for MemoryStore {
        async fn delete_table(&self, _table: &str) -> Result<DeleteOutcome, StoreError> {
            let mut state = self.state.lock().unwrap();
            state.mutations += 1;
            if state.exists {
                state.exists = false;
                state.items.clear();
                Ok(DeleteOutcome::Deleted)
            } else {
                Ok(DeleteOutcome::NotFound)
            }
        }

        async fn create_table(
            &self,
            _table: &str,
            _schema: &TableKeySchema,
        ) -> Result<(), StoreError> {
            let mut state = self.state.lock().unwrap();
            state.mutations += 1;
            state.exists = true;
            Ok(())
        }

        async fn table_state(&self, _table: &str) -> Result<TableState, StoreError> {
            let state = self.state.lock().unwrap();
            if state.exists {
                Ok(TableState::Active)
            } else {
                Ok(TableState::Absent)
            }
        }

        async fn put_batch(
            &self,
            _table: &str,
            records: &[CertificationRecord],
        ) -> Result<PutOutcome, StoreError> {
            let mut state = self.state.lock().unwrap();
            state.mutations += 1;
            for record in records {
                state.items.insert(
                    (record.email.clone(), record.certificate_name.clone()),
                    record.clone(),
                );
            }
            Ok(PutOutcome { unprocessed: 0 })
        }
    }

    fn pipeline_over(store: Arc<MemoryStore>, export: &str) -> SyncPipeline {
        let wait = WaitPolicy {
            timeout: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
        };
        SyncPipeline::new(
            Box::new(StaticCredentials),
            Box::new(CannedLogin),
            Box::new(CannedReport(export.as_bytes().to_vec())),
            TableReplacer::new(store, "certifications", wait),
        )
    }

    const EXPORT: &str = "\
User Name,Work Email,Certificate Name,Certificate Level,Award Date,Expiration Date\n\
xxxxxx,xxxxxx,Cloud Practitioner,Foundational,1/1/2020,1/1/2023\n\
Jane Doe,jane@example.com,Solutions Architect,Professional,6/15/2019,6/15/2023";

    #[tokio::test]
    async fn run_replaces_the_table_with_the_normalized_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let summary = pipeline_over(store.clone(), EXPORT).run_once().await.unwrap();

        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.message(), "Found 2 certifications...");

        let state = store.state.lock().unwrap();
        assert_eq!(state.items.len(), 2);
        let anonymized = state
            .items
            .get(&("unknown-0".to_string(), "Cloud Practitioner".to_string()))
            .unwrap();
        assert_eq!(anonymized.user_name, "unknown-0");
        let named = state
            .items
            .get(&("jane@example.com".to_string(), "Solutions Architect".to_string()))
            .unwrap();
        assert_eq!(
            certsnap_core::format_short_date(named.last_certification_date),
            "6/15/2020"
        );
    }

    #[tokio::test]
    async fn malformed_export_aborts_before_any_table_mutation() {
        let bad = "\
User Name,Work Email,Certificate Name,Certificate Level,Award Date,Expiration Date\n\
Jane Doe,jane@example.com,Cert A,Associate,not-a-date,1/1/2023";
        let store = Arc::new(MemoryStore::default());
        let err = pipeline_over(store.clone(), bad).run_once().await.unwrap_err();

        assert!(err.to_string().contains("normalizing certification export"));
        assert_eq!(store.state.lock().unwrap().mutations, 0);
    }
}
