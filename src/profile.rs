//! Live profile change notifications.
//!
//! Notifications carry no payload the engine trusts: each one only means
//! "re-fetch the profile of this user". Duplicate or reordered deliveries are
//! therefore harmless.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use async_trait::async_trait;
use tracing::debug;

/// Invoked once per observed update. Must not block.
pub type OnProfileChanged = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("profile channel unavailable: {0}")]
    Unavailable(String),
}

/// Handle to an open per-user channel.
pub trait ProfileSubscription: Send {
    /// Closes the channel. Calling it again does nothing.
    fn unsubscribe(&mut self);
}

#[async_trait]
pub trait ProfileChannel: Send + Sync {
    async fn subscribe(
        &self,
        user_id: &str,
        on_changed: OnProfileChanged,
    ) -> Result<Box<dyn ProfileSubscription>, ChannelError>;
}

#[derive(Default)]
struct FeedInner {
    next_id: u64,
    listeners: HashMap<u64, (String, OnProfileChanged)>,
}

/// In-process channel. The host calls [`ProfileFeed::notify`] from its
/// realtime client whenever a profile row changes.
#[derive(Clone, Default)]
pub struct ProfileFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl ProfileFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals an update of `user_id`'s profile. Returns how many subscribers
    /// were notified.
    pub fn notify(&self, user_id: &str) -> usize {
        let targets: Vec<OnProfileChanged> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .values()
            .filter(|(id, _)| id == user_id)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in &targets {
            handler();
        }
        targets.len()
    }

    pub fn subscriber_count(&self, user_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .values()
            .filter(|(id, _)| id == user_id)
            .count()
    }
}

#[async_trait]
impl ProfileChannel for ProfileFeed {
    async fn subscribe(
        &self,
        user_id: &str,
        on_changed: OnProfileChanged,
    ) -> Result<Box<dyn ProfileSubscription>, ChannelError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.insert(id, (user_id.to_string(), on_changed));
        debug!(user_id, subscription = id, "profile channel opened");
        Ok(Box::new(FeedSubscription {
            feed: Arc::downgrade(&self.inner),
            id,
            open: true,
        }))
    }
}

struct FeedSubscription {
    feed: Weak<Mutex<FeedInner>>,
    id: u64,
    open: bool,
}

impl ProfileSubscription for FeedSubscription {
    fn unsubscribe(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Some(feed) = self.feed.upgrade() {
            feed.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .remove(&self.id);
            debug!(subscription = self.id, "profile channel closed");
        }
    }
}
