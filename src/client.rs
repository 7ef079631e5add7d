use std::sync::Arc;
use synccore::events::{Channel, EventMask};
use synccore::net::{MutationApi, ProfileLookup, QueryApi};
use synccore::types::Viewer;

use crate::config::SyncConfig;
use crate::directory::RoomDirectory;
use crate::error::SyncError;
use crate::store::{CacheBackend, MemoryCacheBackend, PersistentCache};
use crate::timeline::MessageTimeline;
use crate::transport::{PushTransport, Subscription};
use crate::typing::TypingTracker;
use crate::unread::UnreadCounter;

/// Shared context of one signed-in viewer: collaborator handles, the
/// viewer-scoped cache and configuration. Every sync component is created
/// from here.
pub struct Client {
    viewer: Viewer,
    config: SyncConfig,
    pub(crate) query: Arc<dyn QueryApi>,
    pub(crate) mutation: Arc<dyn MutationApi>,
    pub(crate) profiles: Arc<dyn ProfileLookup>,
    pub(crate) transport: Arc<dyn PushTransport>,
    pub(crate) cache: PersistentCache,
}

impl Client {
    pub fn builder(viewer: Viewer) -> ClientBuilder {
        ClientBuilder::new(viewer)
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &PersistentCache {
        &self.cache
    }

    pub fn rooms(self: &Arc<Self>) -> Arc<RoomDirectory> {
        RoomDirectory::new(self.clone())
    }

    pub fn timeline(self: &Arc<Self>) -> Arc<MessageTimeline> {
        MessageTimeline::new(self.clone())
    }

    pub fn typing(self: &Arc<Self>, room_id: impl Into<String>) -> Arc<TypingTracker> {
        TypingTracker::new(self.clone(), room_id.into())
    }

    pub fn unread(self: &Arc<Self>) -> Arc<UnreadCounter> {
        UnreadCounter::new(self.clone())
    }

    /// Purges this viewer's expired cache entries.
    pub async fn sweep_cache(&self) -> usize {
        self.cache.sweep().await
    }

    pub(crate) async fn subscribe(
        &self,
        channel: Channel,
        mask: EventMask,
    ) -> Result<Subscription, SyncError> {
        self.transport
            .subscribe(channel.clone(), mask)
            .await
            .map_err(|source| SyncError::Subscribe {
                channel: channel.to_string(),
                source,
            })
    }
}

pub struct ClientBuilder {
    viewer: Viewer,
    config: SyncConfig,
    query: Option<Arc<dyn QueryApi>>,
    mutation: Option<Arc<dyn MutationApi>>,
    profiles: Option<Arc<dyn ProfileLookup>>,
    transport: Option<Arc<dyn PushTransport>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
}

impl ClientBuilder {
    fn new(viewer: Viewer) -> Self {
        Self {
            viewer,
            config: SyncConfig::default(),
            query: None,
            mutation: None,
            profiles: None,
            transport: None,
            cache_backend: None,
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses one object for every backend-facing contract.
    pub fn with_backend<B>(self, backend: Arc<B>) -> Self
    where
        B: QueryApi + MutationApi + ProfileLookup + PushTransport + 'static,
    {
        self.with_query(backend.clone())
            .with_mutation(backend.clone())
            .with_profiles(backend.clone())
            .with_transport(backend)
    }

    pub fn with_query(mut self, query: Arc<dyn QueryApi>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_mutation(mut self, mutation: Arc<dyn MutationApi>) -> Self {
        self.mutation = Some(mutation);
        self
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileLookup>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Storage for the persistent cache. Defaults to an in-memory backend.
    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Arc<Client>, anyhow::Error> {
        let query = self
            .query
            .ok_or_else(|| anyhow::anyhow!("a query API is required"))?;
        let mutation = self
            .mutation
            .ok_or_else(|| anyhow::anyhow!("a mutation API is required"))?;
        let profiles = self
            .profiles
            .ok_or_else(|| anyhow::anyhow!("a profile lookup is required"))?;
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("a push transport is required"))?;
        let cache_backend = self
            .cache_backend
            .unwrap_or_else(|| Arc::new(MemoryCacheBackend::new()));
        let cache = PersistentCache::new(
            cache_backend,
            self.viewer.id.clone(),
            self.config.cache_retention,
        );

        Ok(Arc::new(Client {
            viewer: self.viewer,
            config: self.config,
            query,
            mutation,
            profiles,
            transport,
            cache,
        }))
    }
}
