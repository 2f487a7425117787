//! Keyed session pool and provider registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use sb_domain::event::SessionStatus;
use sb_domain::Result;

use crate::session::AgentSession;

/// Options supplied when a session is created.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    /// Resume an existing backend conversation.
    pub resume_session_id: Option<String>,
}

/// A backend capable of creating sessions.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn id(&self) -> &str;

    /// One-time setup (credential checks, binary probing). Failures here
    /// keep the provider out of the registry but do not abort startup.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn create_session(&self, options: SessionOptions) -> Result<Arc<dyn AgentSession>>;
}

/// Owns `key → session` and the set of registered providers.
#[derive(Default)]
pub struct SessionManager {
    providers: RwLock<HashMap<String, Arc<dyn AgentProvider>>>,
    sessions: RwLock<HashMap<String, Arc<dyn AgentSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider after awaiting its `initialize`. An init failure
    /// is logged and the provider skipped.
    pub async fn register_provider(&self, provider: Arc<dyn AgentProvider>) {
        let id = provider.id().to_string();
        match provider.initialize().await {
            Ok(()) => {
                self.providers.write().await.insert(id.clone(), provider);
                tracing::info!(provider = %id, "provider registered");
            }
            Err(e) => {
                tracing::warn!(provider = %id, error = %e, "provider initialization failed, skipping");
            }
        }
    }

    /// Create (or replace) the session under `key`. An existing non-closed
    /// session is closed first.
    pub async fn create_session(
        &self,
        key: &str,
        provider_id: &str,
        options: SessionOptions,
    ) -> Result<Arc<dyn AgentSession>> {
        let provider = self
            .providers
            .read()
            .await
            .get(provider_id)
            .cloned()
            .ok_or_else(|| sb_domain::Error::Config(format!("no provider registered: {provider_id}")))?;

        if let Some(existing) = self.sessions.read().await.get(key).cloned() {
            existing.close().await;
        }

        let session = provider.create_session(options).await?;
        self.sessions
            .write()
            .await
            .insert(key.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, key: &str) -> Option<Arc<dyn AgentSession>> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Close and remove. Returns whether a session existed.
    pub async fn remove_session(&self, key: &str) -> bool {
        let removed = self.sessions.write().await.remove(key);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn list_sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn list_providers(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    pub async fn status(&self, key: &str) -> Option<SessionStatus> {
        let session = self.sessions.read().await.get(key).cloned()?;
        Some(session.status())
    }
}
