//! Queue lifecycle, lookup and caching.
//!
//! [`QueueManager`] is the single access point for queue existence, URL, ARN
//! and attributes. Definitions are cached in a [`QueueCache`]; the cache is an
//! optimization and never the source of truth, so a lookup that misses it (or
//! asks for a forced recheck) always goes back to the remote service.

use crate::client::{
    attributes, SqsClient, MAX_BATCH_SIZE, MAX_RECEIVE_WAIT_SECS, MAX_VISIBILITY_TIMEOUT_SECS,
};
use crate::config::QueueSettings;
use crate::error::{QueueError, SerializationError};
use crate::message::{QueueName, TEMP_QUEUE_PREFIX};
use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "queue_manager_tests.rs"]
mod tests;

// ============================================================================
// Redrive Policy
// ============================================================================

/// Dead-letter routing rule stored as the `RedrivePolicy` queue attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    #[serde(deserialize_with = "number_or_string")]
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn new(dead_letter_target_arn: impl Into<String>, max_receive_count: u32) -> Self {
        Self {
            dead_letter_target_arn: dead_letter_target_arn.into(),
            max_receive_count,
        }
    }

    /// Parse the embedded JSON attribute value
    pub fn from_json(json: &str) -> Result<Self, SerializationError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The service reports `maxReceiveCount` as a string, while clients usually
/// write a number
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u32),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

// ============================================================================
// Buffer Settings
// ============================================================================

/// Runtime-mutable buffering thresholds of one queue.
///
/// Shared by the queue's definition and its buffer, so changes apply to
/// operations already in flight. Each threshold is kept within
/// `1..=MAX_BATCH_SIZE`.
#[derive(Debug)]
pub struct BufferSettings {
    send: AtomicUsize,
    receive: AtomicUsize,
    delete: AtomicUsize,
    change_visibility: AtomicUsize,
    disable_buffering: AtomicBool,
}

fn clamp_buffer_size(size: usize) -> usize {
    size.clamp(1, MAX_BATCH_SIZE)
}

impl BufferSettings {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            send: AtomicUsize::new(clamp_buffer_size(settings.send_buffer_size)),
            receive: AtomicUsize::new(clamp_buffer_size(settings.receive_buffer_size)),
            delete: AtomicUsize::new(clamp_buffer_size(settings.delete_buffer_size)),
            change_visibility: AtomicUsize::new(clamp_buffer_size(
                settings.change_visibility_buffer_size,
            )),
            disable_buffering: AtomicBool::new(settings.disable_buffering),
        }
    }

    pub fn send_buffer_size(&self) -> usize {
        self.send.load(Ordering::Acquire)
    }

    pub fn set_send_buffer_size(&self, size: usize) {
        self.send.store(clamp_buffer_size(size), Ordering::Release);
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.receive.load(Ordering::Acquire)
    }

    pub fn set_receive_buffer_size(&self, size: usize) {
        self.receive.store(clamp_buffer_size(size), Ordering::Release);
    }

    pub fn delete_buffer_size(&self) -> usize {
        self.delete.load(Ordering::Acquire)
    }

    pub fn set_delete_buffer_size(&self, size: usize) {
        self.delete.store(clamp_buffer_size(size), Ordering::Release);
    }

    pub fn change_visibility_buffer_size(&self) -> usize {
        self.change_visibility.load(Ordering::Acquire)
    }

    pub fn set_change_visibility_buffer_size(&self, size: usize) {
        self.change_visibility
            .store(clamp_buffer_size(size), Ordering::Release);
    }

    pub fn is_buffering_disabled(&self) -> bool {
        self.disable_buffering.load(Ordering::Acquire)
    }

    pub fn set_disable_buffering(&self, disabled: bool) {
        self.disable_buffering.store(disabled, Ordering::Release);
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self::from_settings(&QueueSettings::default())
    }
}

// ============================================================================
// Queue Definition
// ============================================================================

/// Cached description of one remote queue
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub queue_name: QueueName,
    pub queue_url: String,
    pub queue_arn: Option<String>,
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub approximate_number_of_messages: u64,
    /// Seconds since the Unix epoch
    pub created_timestamp: i64,
    pub redrive_policy: Option<RedrivePolicy>,
    pub buffering: Arc<BufferSettings>,
}

impl QueueDefinition {
    /// Build a definition from the attributes the remote service reported
    pub fn from_attributes(
        queue_name: QueueName,
        queue_url: String,
        attrs: &HashMap<String, String>,
        buffering: Arc<BufferSettings>,
    ) -> Self {
        fn parsed<T: std::str::FromStr>(attrs: &HashMap<String, String>, key: &str) -> Option<T> {
            attrs.get(key).and_then(|v| v.parse().ok())
        }

        let redrive_policy = attrs
            .get(attributes::REDRIVE_POLICY)
            .filter(|json| !json.is_empty())
            .and_then(|json| match RedrivePolicy::from_json(json) {
                Ok(policy) => Some(policy),
                Err(e) => {
                    warn!(queue = %queue_name, error = %e, "Ignoring unparseable redrive policy");
                    None
                }
            });

        Self {
            queue_arn: attrs.get(attributes::QUEUE_ARN).cloned(),
            visibility_timeout: parsed(attrs, attributes::VISIBILITY_TIMEOUT).unwrap_or(30),
            receive_wait_time: parsed(attrs, attributes::RECEIVE_WAIT_TIME).unwrap_or(0),
            approximate_number_of_messages: parsed(attrs, attributes::APPROXIMATE_NUMBER_OF_MESSAGES)
                .unwrap_or(0),
            created_timestamp: parsed(attrs, attributes::CREATED_TIMESTAMP).unwrap_or(0),
            redrive_policy,
            queue_name,
            queue_url,
            buffering,
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.queue_name.is_temporary()
    }
}

// ============================================================================
// Create Options
// ============================================================================

/// Attributes requested when creating or updating a queue.
///
/// Unset values fall back to the manager's [`QueueSettings`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    pub visibility_timeout: Option<u32>,
    pub receive_wait_time: Option<u32>,
    pub disable_buffering: Option<bool>,
    pub redrive_policy: Option<RedrivePolicy>,
}

impl QueueOptions {
    pub fn with_visibility_timeout(mut self, seconds: u32) -> Self {
        self.visibility_timeout = Some(seconds);
        self
    }

    pub fn with_receive_wait_time(mut self, seconds: u32) -> Self {
        self.receive_wait_time = Some(seconds);
        self
    }

    pub fn with_disable_buffering(mut self, disabled: bool) -> Self {
        self.disable_buffering = Some(disabled);
        self
    }

    pub fn with_redrive_policy(mut self, policy: RedrivePolicy) -> Self {
        self.redrive_policy = Some(policy);
        self
    }
}

/// Queue shape requested by a message server worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerQueueOptions {
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub disable_buffering: bool,
    pub retry_count: u32,
}

impl WorkerQueueOptions {
    /// Options whose redrive policy (if a dead-letter ARN is given) allows
    /// `1 + retry_count` deliveries
    pub fn to_queue_options(&self, dead_letter_arn: Option<&str>) -> QueueOptions {
        QueueOptions {
            visibility_timeout: Some(self.visibility_timeout),
            receive_wait_time: Some(self.receive_wait_time),
            disable_buffering: Some(self.disable_buffering),
            redrive_policy: dead_letter_arn
                .map(|arn| RedrivePolicy::new(arn, self.retry_count.saturating_add(1))),
        }
    }
}

// ============================================================================
// Queue Cache
// ============================================================================

/// Concurrent map from queue name to its cached definition.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct QueueCache {
    entries: Arc<DashMap<QueueName, Arc<QueueDefinition>>>,
}

impl QueueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &QueueName) -> Option<Arc<QueueDefinition>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, definition: Arc<QueueDefinition>) {
        self.entries
            .insert(definition.queue_name.clone(), definition);
    }

    pub fn remove(&self, name: &QueueName) -> Option<Arc<QueueDefinition>> {
        self.entries.remove(name).map(|(_, definition)| definition)
    }

    pub fn contains(&self, name: &QueueName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Snapshot of the cached definitions
    pub fn definitions(&self) -> Vec<Arc<QueueDefinition>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

// ============================================================================
// Queue Manager
// ============================================================================

/// Queue lifecycle operations on top of a remote client and a cache
pub struct QueueManager {
    client: Arc<dyn SqsClient>,
    cache: QueueCache,
    defaults: QueueSettings,
}

impl QueueManager {
    /// Create a manager with its own cache and default queue settings
    pub fn new(client: Arc<dyn SqsClient>) -> Self {
        Self::with_cache(client, QueueCache::new(), QueueSettings::default())
    }

    /// Create a manager over an existing (possibly shared) cache
    pub fn with_cache(client: Arc<dyn SqsClient>, cache: QueueCache, defaults: QueueSettings) -> Self {
        Self {
            client,
            cache,
            defaults,
        }
    }

    pub fn client(&self) -> &Arc<dyn SqsClient> {
        &self.client
    }

    pub fn cache(&self) -> &QueueCache {
        &self.cache
    }

    pub fn defaults(&self) -> &QueueSettings {
        &self.defaults
    }

    /// Create the queue, or update its attributes in place when it already
    /// exists with different ones (last writer wins).
    ///
    /// An existing redrive policy is only replaced when `options` carries one.
    pub async fn create_queue(
        &self,
        name: &QueueName,
        options: &QueueOptions,
    ) -> Result<Arc<QueueDefinition>, QueueError> {
        let attrs = self.attributes_for(name, options)?;

        let queue_url = match self.client.create_queue(name, &attrs).await {
            Ok(url) => url,
            Err(QueueError::QueueNameConflict { .. }) => {
                let url = self.client.get_queue_url(name).await?;
                self.client.set_queue_attributes(&url, &attrs).await?;
                info!(queue = %name, "Updated attributes of existing queue");
                url
            }
            Err(e) => return Err(e),
        };

        self.refresh(name, queue_url, options.disable_buffering)
            .await
    }

    /// Create the queue; fail with `QueueNameConflict` when it already exists
    /// with different attributes
    pub async fn create_queue_strict(
        &self,
        name: &QueueName,
        options: &QueueOptions,
    ) -> Result<Arc<QueueDefinition>, QueueError> {
        let attrs = self.attributes_for(name, options)?;
        let queue_url = self.client.create_queue(name, &attrs).await?;
        self.refresh(name, queue_url, options.disable_buffering)
            .await
    }

    /// Create a worker's inbound queue, wiring a redrive policy to the given
    /// dead-letter queue ARN
    pub async fn create_queue_for_worker(
        &self,
        name: &QueueName,
        worker: &WorkerQueueOptions,
        dead_letter_arn: Option<&str>,
    ) -> Result<Arc<QueueDefinition>, QueueError> {
        self.create_queue(name, &worker.to_queue_options(dead_letter_arn))
            .await
    }

    /// Cached or fetched definition, creating the queue with defaults when
    /// the remote service does not know it
    pub async fn get_or_create(&self, name: &QueueName) -> Result<Arc<QueueDefinition>, QueueError> {
        match self.get_queue_definition(name, false).await {
            Err(e) if e.is_not_found() => self.create_queue(name, &QueueOptions::default()).await,
            other => other,
        }
    }

    /// Whether the queue exists; trusts the cache unless `force_recheck`
    pub async fn queue_exists(
        &self,
        name: &QueueName,
        force_recheck: bool,
    ) -> Result<bool, QueueError> {
        match self.get_queue_definition(name, force_recheck).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_queue_url(
        &self,
        name: &QueueName,
        force_recheck: bool,
    ) -> Result<String, QueueError> {
        Ok(self
            .get_queue_definition(name, force_recheck)
            .await?
            .queue_url
            .clone())
    }

    /// Definition of the queue; a not-found answer from the remote service
    /// evicts any cached entry
    pub async fn get_queue_definition(
        &self,
        name: &QueueName,
        force_recheck: bool,
    ) -> Result<Arc<QueueDefinition>, QueueError> {
        if !force_recheck {
            if let Some(definition) = self.cache.get(name) {
                return Ok(definition);
            }
        }

        let result = match self.client.get_queue_url(name).await {
            Ok(url) => self.refresh(name, url, None).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            if e.is_not_found() && self.cache.remove(name).is_some() {
                debug!(queue = %name, "Evicted queue missing at the remote service");
            }
        }
        result
    }

    /// Delete the queue; succeeds when it does not exist
    pub async fn delete_queue(&self, name: &QueueName) -> Result<(), QueueError> {
        let cached_url = self.cache.remove(name).map(|d| d.queue_url.clone());
        let queue_url = match cached_url {
            Some(url) => url,
            None => match self.client.get_queue_url(name).await {
                Ok(url) => url,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            },
        };

        match self.client.delete_queue(&queue_url).await {
            Ok(()) => {
                info!(queue = %name, "Deleted queue");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove all messages from the queue; succeeds when it does not exist
    pub async fn purge_queue(&self, name: &QueueName) -> Result<(), QueueError> {
        let queue_url = match self.get_queue_url(name, false).await {
            Ok(url) => url,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.client.purge_queue(&queue_url).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                self.cache.remove(name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Queue URLs known to the remote service, optionally filtered by prefix
    pub async fn list_queues(&self, prefix: Option<&str>) -> Result<Vec<String>, QueueError> {
        self.client.list_queues(prefix).await
    }

    /// Delete temporary queues that are empty and were created before
    /// `older_than_epoch_seconds`; returns how many were removed.
    ///
    /// Cached temporary queues are checked too, so queues that a listing does
    /// not show yet are still considered. Queues that disappear while the
    /// sweep runs are skipped.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sqs_mq::{InMemorySqs, QueueManager, QueueNames, Timestamp};
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let manager = QueueManager::new(Arc::new(InMemorySqs::default()));
    /// let reply_queue = QueueNames::default().temp_queue();
    /// manager.get_or_create(&reply_queue).await.unwrap();
    ///
    /// let cutoff = Timestamp::now().epoch_seconds() + 1;
    /// assert_eq!(manager.remove_empty_temporary_queues(cutoff).await.unwrap(), 1);
    /// assert!(!manager.queue_exists(&reply_queue, true).await.unwrap());
    /// # });
    /// ```
    pub async fn remove_empty_temporary_queues(
        &self,
        older_than_epoch_seconds: i64,
    ) -> Result<usize, QueueError> {
        let mut candidates: BTreeMap<QueueName, String> = BTreeMap::new();

        for url in self.client.list_queues(Some(TEMP_QUEUE_PREFIX)).await? {
            match QueueName::from_queue_url(&url) {
                Ok(name) if name.is_temporary() => {
                    candidates.insert(name, url);
                }
                _ => debug!(queue_url = %url, "Skipping non-temporary queue"),
            }
        }
        for definition in self.cache.definitions() {
            if definition.is_temporary() {
                candidates
                    .entry(definition.queue_name.clone())
                    .or_insert_with(|| definition.queue_url.clone());
            }
        }

        let mut removed = 0;
        for (name, url) in candidates {
            let attrs = match self.client.get_queue_attributes(&url).await {
                Ok(attrs) => attrs,
                Err(e) if e.is_not_found() => {
                    self.cache.remove(&name);
                    continue;
                }
                Err(e) => {
                    warn!(queue = %name, error = %e, "Could not inspect temporary queue");
                    continue;
                }
            };

            let definition = QueueDefinition::from_attributes(
                name.clone(),
                url.clone(),
                &attrs,
                Arc::new(BufferSettings::default()),
            );
            if definition.approximate_number_of_messages > 0
                || definition.created_timestamp >= older_than_epoch_seconds
            {
                continue;
            }

            match self.client.delete_queue(&url).await {
                Ok(()) => {
                    self.cache.remove(&name);
                    removed += 1;
                    debug!(queue = %name, "Removed empty temporary queue");
                }
                Err(e) if e.is_not_found() => {
                    self.cache.remove(&name);
                }
                Err(e) => warn!(queue = %name, error = %e, "Failed to remove temporary queue"),
            }
        }

        if removed > 0 {
            info!(removed = removed, "Removed empty temporary queues");
        }
        Ok(removed)
    }

    /// Drop a cached definition; the next lookup asks the remote service
    pub fn evict(&self, name: &QueueName) -> bool {
        self.cache.remove(name).is_some()
    }

    async fn refresh(
        &self,
        name: &QueueName,
        queue_url: String,
        disable_buffering: Option<bool>,
    ) -> Result<Arc<QueueDefinition>, QueueError> {
        let attrs = self.client.get_queue_attributes(&queue_url).await?;

        let buffering = match self.cache.get(name) {
            Some(existing) => Arc::clone(&existing.buffering),
            None => Arc::new(BufferSettings::from_settings(&self.defaults)),
        };
        if let Some(disabled) = disable_buffering {
            buffering.set_disable_buffering(disabled);
        }

        let definition = Arc::new(QueueDefinition::from_attributes(
            name.clone(),
            queue_url,
            &attrs,
            buffering,
        ));
        self.cache.insert(Arc::clone(&definition));
        Ok(definition)
    }

    fn attributes_for(
        &self,
        name: &QueueName,
        options: &QueueOptions,
    ) -> Result<HashMap<String, String>, QueueError> {
        let visibility = options
            .visibility_timeout
            .unwrap_or(self.defaults.visibility_timeout);
        let wait = options
            .receive_wait_time
            .unwrap_or(self.defaults.receive_wait_time);

        if visibility > MAX_VISIBILITY_TIMEOUT_SECS {
            warn!(queue = %name, requested = visibility, "Clamping visibility timeout");
        }
        if wait > MAX_RECEIVE_WAIT_SECS {
            warn!(queue = %name, requested = wait, "Clamping receive wait time");
        }

        let mut attrs = HashMap::from([
            (
                attributes::VISIBILITY_TIMEOUT.to_string(),
                visibility.min(MAX_VISIBILITY_TIMEOUT_SECS).to_string(),
            ),
            (
                attributes::RECEIVE_WAIT_TIME.to_string(),
                wait.min(MAX_RECEIVE_WAIT_SECS).to_string(),
            ),
        ]);
        if let Some(policy) = &options.redrive_policy {
            attrs.insert(attributes::REDRIVE_POLICY.to_string(), policy.to_json()?);
        }
        Ok(attrs)
    }
}
