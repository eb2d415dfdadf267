//! Live update fanout
//!
//! Subscribers get a bounded channel each. Delivery never waits: a subscriber
//! whose queue is full or whose receiver is gone is dropped, and only that
//! subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use crate::domain::record::AccumulatedRecord;

pub const SUBSCRIBER_QUEUE: usize = 64;

/// Event pushed after a successful cycle of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlerUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub account: String,
    pub data: Vec<AccumulatedRecord>,
    pub timestamp: DateTime<Utc>,
}

impl CrawlerUpdate {
    pub fn new(account: impl Into<String>, data: Vec<AccumulatedRecord>) -> Self {
        Self {
            kind: "crawler_update",
            account: account.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

pub type SubscriberId = u64;

/// Receiving half handed to a subscriber
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Arc<CrawlerUpdate>>,
}

#[derive(Default)]
struct Subscribers {
    next_id: SubscriberId,
    senders: HashMap<SubscriberId, mpsc::Sender<Arc<CrawlerUpdate>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Clone, Default)]
pub struct NotificationHub {
    inner: Arc<Mutex<Subscribers>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(SUBSCRIBER_QUEUE)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.senders.insert(id, sender);
        debug!(subscriber = id, "subscriber added");
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.senders.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .senders
            .len()
    }

    /// Push one update to every subscriber
    pub fn notify(&self, update: CrawlerUpdate) -> Delivery {
        let update = Arc::new(update);
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut delivery = Delivery::default();
        inner.senders.retain(|id, sender| match sender.try_send(Arc::clone(&update)) {
            Ok(()) => {
                delivery.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                info!(subscriber = id, "subscriber queue full, removing");
                delivery.dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone, removing");
                delivery.dropped += 1;
                false
            }
        });
        delivery
    }
}
