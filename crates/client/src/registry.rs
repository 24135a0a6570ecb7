//! Job-scoped listener bookkeeping on top of the realtime channel.
//!
//! The channel delivers events for every job to every listener of a
//! category. [`SubscriptionRegistry::register`] wraps caller handlers so
//! they only see events for their own job, and reference-counts interest
//! per job so the server subscription is dropped when the last
//! interested party goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use singwithme_core::JobId;

use crate::channel::{ListenerHandle, RealtimeChannel};
use crate::events::{ChannelEvent, EventCategory};
use crate::lock;

/// Handler for one event category of one job.
pub type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Handlers a caller wants run for a job's events.
#[derive(Default, Clone)]
pub struct JobHandlers {
    pub on_status: Option<Handler>,
    pub on_complete: Option<Handler>,
    pub on_error: Option<Handler>,
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status(mut self, f: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        self.on_status = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Composite deregistration token for one [`SubscriptionRegistry::register`]
/// call.
#[derive(Debug)]
pub struct SubscriptionToken {
    job_id: JobId,
    handles: Vec<ListenerHandle>,
    released: AtomicBool,
}

impl SubscriptionToken {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct SubscriptionRegistry {
    channel: RealtimeChannel,
    /// Live registrations per job.
    interests: Mutex<HashMap<JobId, usize>>,
}

impl SubscriptionRegistry {
    pub fn new(channel: RealtimeChannel) -> Self {
        Self {
            channel,
            interests: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    /// Register job-scoped handlers.
    ///
    /// The first registration for a job subscribes to it on the server,
    /// or queues the subscription until the channel connects.
    pub fn register(&self, job_id: &JobId, handlers: JobHandlers) -> SubscriptionToken {
        let categories = [
            (EventCategory::StatusUpdate, handlers.on_status),
            (EventCategory::ProcessingComplete, handlers.on_complete),
            (EventCategory::ProcessingError, handlers.on_error),
        ];

        let handles = categories
            .into_iter()
            .filter_map(|(category, handler)| handler.map(|h| (category, h)))
            .map(|(category, handler)| {
                let scoped = job_id.clone();
                self.channel.add_event_listener(category, move |event| {
                    if event.is_for(&scoped) {
                        handler(event);
                    }
                })
            })
            .collect();

        let first = {
            let mut interests = lock(&self.interests);
            let count = interests.entry(job_id.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first && !self.channel.subscribe_to_job(job_id) {
            tracing::debug!(job_id = %job_id, "Channel not connected, queueing subscription");
            self.channel.queue_subscription(job_id);
        }

        SubscriptionToken {
            job_id: job_id.clone(),
            handles,
            released: AtomicBool::new(false),
        }
    }

    /// Remove every listener created by the `register` call that produced
    /// `token`. Idempotent, and safe to call from one of those listeners.
    pub fn deregister(&self, token: &SubscriptionToken) {
        if token.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in &token.handles {
            handle.remove();
        }

        let last = {
            let mut interests = lock(&self.interests);
            match interests.get_mut(&token.job_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    interests.remove(&token.job_id);
                    true
                }
                None => false,
            }
        };
        if last {
            self.channel.unsubscribe_from_job(&token.job_id);
        }
    }

    /// Number of live registrations for `job_id`.
    pub fn interest_count(&self, job_id: &JobId) -> usize {
        lock(&self.interests).get(job_id).copied().unwrap_or(0)
    }
}
