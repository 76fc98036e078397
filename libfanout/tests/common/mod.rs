//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libfanout::error::{PlatformError, Result};
use libfanout::notify::{FailureNotifier, PlatformFailure};
use libfanout::platforms::{Publisher, PublisherRegistry};
use libfanout::retry::RetryPolicy;
use libfanout::tokens::{RefreshedToken, TokenManager, TokenRefresher};
use libfanout::vault::{AgeVault, CredentialVault};
use libfanout::{
    Connection, Database, Platform, Publication, PublishEngine, PublishJob, TargetAccount,
};
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const REFRESH_MARGIN_SECS: i64 = 3600;

/// A failure notification as received by the notifier
#[derive(Debug, Clone)]
pub struct Notification {
    pub user_id: String,
    pub publication_id: String,
    pub failures: Vec<PlatformFailure>,
}

pub struct RecordingNotifier {
    sender: mpsc::UnboundedSender<Notification>,
}

#[async_trait]
impl FailureNotifier for RecordingNotifier {
    async fn notify_publish_failed(
        &self,
        user_id: &str,
        publication_id: &str,
        failures: &[PlatformFailure],
    ) -> Result<()> {
        let _ = self.sender.send(Notification {
            user_id: user_id.to_string(),
            publication_id: publication_id.to_string(),
            failures: failures.to_vec(),
        });
        Ok(())
    }
}

/// Refresher that answers without network access and records what it was asked
pub struct StubRefresher {
    calls: Mutex<Vec<(Platform, String)>>,
    fail: bool,
    rotate_refresh: bool,
}

impl StubRefresher {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: false,
            rotate_refresh: true,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn without_rotation() -> Self {
        Self {
            rotate_refresh: false,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<(Platform, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, platform: Platform, token: &SecretString) -> Result<RefreshedToken> {
        self.calls
            .lock()
            .unwrap()
            .push((platform, token.expose_secret().to_string()));

        if self.fail {
            return Err(PlatformError::Authentication("refresh token revoked".to_string()).into());
        }

        Ok(RefreshedToken {
            access_token: SecretString::from(format!("fresh-{}", platform)),
            refresh_token: self
                .rotate_refresh
                .then(|| SecretString::from(format!("rotated-{}", platform))),
            expires_in: Some(5_184_000),
        })
    }
}

#[async_trait]
impl TokenRefresher for StubRefresher {
    async fn exchange_long_lived(
        &self,
        platform: Platform,
        access_token: &SecretString,
    ) -> Result<RefreshedToken> {
        self.answer(platform, access_token)
    }

    async fn refresh_grant(
        &self,
        platform: Platform,
        refresh_token: &SecretString,
    ) -> Result<RefreshedToken> {
        self.answer(platform, refresh_token)
    }
}

/// Engine wired to test doubles
pub struct TestEnv {
    pub engine: PublishEngine,
    pub db: Database,
    pub vault: Arc<AgeVault>,
    pub refresher: Arc<StubRefresher>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    notify_sender: mpsc::UnboundedSender<Notification>,
    _temp_dir: Option<TempDir>,
}

pub struct TestEnvBuilder {
    publishers: Vec<Arc<dyn Publisher>>,
    refresher: StubRefresher,
    on_disk: bool,
}

impl TestEnvBuilder {
    pub fn new() -> Self {
        Self {
            publishers: Vec::new(),
            refresher: StubRefresher::new(),
            on_disk: false,
        }
    }

    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn refresher(mut self, refresher: StubRefresher) -> Self {
        self.refresher = refresher;
        self
    }

    /// File-backed database, for tests that need more than one connection
    pub fn on_disk(mut self) -> Self {
        self.on_disk = true;
        self
    }

    pub async fn build(self) -> TestEnv {
        let (db, temp_dir) = if self.on_disk {
            let temp_dir = TempDir::new().unwrap();
            let path = temp_dir.path().join("fanout.db");
            let db = Database::new(path.to_str().unwrap()).await.unwrap();
            (db, Some(temp_dir))
        } else {
            (Database::in_memory().await.unwrap(), None)
        };

        let vault = Arc::new(AgeVault::generate());
        let refresher = Arc::new(self.refresher);
        let tokens = TokenManager::new(
            db.clone(),
            vault.clone(),
            refresher.clone(),
            REFRESH_MARGIN_SECS,
        );

        let mut registry = PublisherRegistry::new();
        for publisher in self.publishers {
            registry.register(publisher);
        }

        let (sender, notifications) = mpsc::unbounded_channel();
        let engine = PublishEngine::new(
            db.clone(),
            tokens,
            registry,
            RetryPolicy::default(),
            Arc::new(RecordingNotifier {
                sender: sender.clone(),
            }),
        );

        TestEnv {
            engine,
            db,
            vault,
            refresher,
            notifications,
            notify_sender: sender,
            _temp_dir: temp_dir,
        }
    }
}

/// How a seeded connection's credentials look
pub struct Account {
    pub platform: Platform,
    pub expires_at: Option<i64>,
    pub refresh_token: Option<&'static str>,
    pub active: bool,
}

impl Account {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            expires_at: None,
            refresh_token: None,
            active: true,
        }
    }

    pub fn expiring_in(mut self, secs: i64) -> Self {
        self.expires_at = Some(chrono::Utc::now().timestamp() + secs);
        self
    }

    pub fn refresh_token(mut self, token: &'static str) -> Self {
        self.refresh_token = Some(token);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Stored access token plaintext for a seeded connection
pub fn access_token_for(platform: Platform) -> String {
    format!("access-{}", platform)
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Second engine over the same store, vault and notifier with other publishers
    pub fn engine_with(&self, publishers: PublisherRegistry) -> PublishEngine {
        let tokens = TokenManager::new(
            self.db.clone(),
            self.vault.clone(),
            self.refresher.clone(),
            REFRESH_MARGIN_SECS,
        );
        PublishEngine::new(
            self.db.clone(),
            tokens,
            publishers,
            RetryPolicy::default(),
            Arc::new(RecordingNotifier {
                sender: self.notify_sender.clone(),
            }),
        )
    }

    pub async fn create_publication(&self) -> Publication {
        let publication = Publication::new("user-1".to_string(), "client-1".to_string());
        self.db.create_publication(&publication).await.unwrap();
        publication
    }

    /// Add a connection, a target record and its pending job to `publication`
    pub async fn add_target(
        &self,
        publication: &Publication,
        account: Account,
        max_attempts: u32,
    ) -> (Connection, TargetAccount, PublishJob) {
        let access = SecretString::from(access_token_for(account.platform));
        let mut connection = Connection::new(
            publication.client_id.clone(),
            publication.user_id.clone(),
            account.platform,
            format!("{}-account", account.platform),
            self.vault.encrypt(&access).unwrap(),
        );
        connection.token_expires_at = account.expires_at;
        connection.refresh_token = account
            .refresh_token
            .map(|token| self.vault.encrypt(&SecretString::from(token.to_string())).unwrap());
        if !account.active {
            connection.is_active = false;
            connection.last_error = Some("Token revoked by user".to_string());
        }
        self.db.create_connection(&connection).await.unwrap();

        let target = TargetAccount::new(
            publication.id.clone(),
            connection.id.clone(),
            "Launch day".to_string(),
            vec!["launch".to_string()],
            vec![],
        );
        self.db.create_target(&target).await.unwrap();

        let job = PublishJob::new(target.id.clone(), publication.id.clone(), max_attempts);
        self.db.create_job(&job).await.unwrap();

        (connection, target, job)
    }

    /// Next failure notification, waiting briefly for the spawned notifier
    pub async fn next_notification(&mut self) -> Option<Notification> {
        tokio::time::timeout(Duration::from_millis(500), self.notifications.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn decrypt(&self, ciphertext: &str) -> String {
        self.vault.decrypt(ciphertext).unwrap().expose_secret().to_string()
    }
}
