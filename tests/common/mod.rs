//! Common test utilities
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use slotcast::app::Services;
use slotcast::clock::{Clock, FixedClock};
use slotcast::config::Config;
use slotcast::gateway::{Gateway, GatewayError, GatewayResult};
use slotcast::models::{
    ContentId, ContentItem, DeletePolicy, Destination, DestinationId, GroupId, MessageRef,
    NewContent, NewDestination, NewUnit, SelectionMode, UnitId,
};
use slotcast::scheduler::CronSchedule;
use slotcast::storage::{SqliteStore, Store};

pub const TZ: Tz = chrono_tz::Asia::Shanghai;

/// 2024-03-01 09:00 in Shanghai
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap()
}

// ============================================================================
// Recording gateway
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Publish,
    Pin,
    Unpin,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Publish {
        destination: DestinationId,
        content: ContentId,
    },
    Pin {
        destination: DestinationId,
        message: MessageRef,
    },
    Unpin {
        destination: DestinationId,
        message: MessageRef,
    },
    Delete {
        destination: DestinationId,
        message: MessageRef,
    },
}

impl Call {
    pub fn verb(&self) -> Verb {
        match self {
            Call::Publish { .. } => Verb::Publish,
            Call::Pin { .. } => Verb::Pin,
            Call::Unpin { .. } => Verb::Unpin,
            Call::Delete { .. } => Verb::Delete,
        }
    }

    pub fn destination(&self) -> DestinationId {
        match self {
            Call::Publish { destination, .. }
            | Call::Pin { destination, .. }
            | Call::Unpin { destination, .. }
            | Call::Delete { destination, .. } => *destination,
        }
    }
}

/// In-memory platform that records every call and fails on demand
pub struct RecordingGateway {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<(Verb, DestinationId), VecDeque<GatewayError>>>,
    next_message: AtomicI64,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_message: AtomicI64::new(1000),
        }
    }

    /// Fail the next `times` calls of `verb` on `destination` with `error`
    pub fn fail(&self, verb: Verb, destination: DestinationId, error: GatewayError, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry((verb, destination)).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.calls().iter().filter(|c| c.verb() == verb).count()
    }

    pub fn calls_for(&self, destination: DestinationId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.destination() == destination)
            .collect()
    }

    fn record(&self, call: Call) -> GatewayResult<()> {
        let key = (call.verb(), call.destination());
        self.calls.lock().unwrap().push(call);
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|q| q.pop_front())
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish(&self, content: &ContentItem, destination: &Destination) -> GatewayResult<MessageRef> {
        self.record(Call::Publish {
            destination: destination.id,
            content: content.id,
        })?;
        Ok(MessageRef(self.next_message.fetch_add(1, Ordering::SeqCst)))
    }

    async fn pin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        self.record(Call::Pin {
            destination: destination.id,
            message,
        })
    }

    async fn unpin(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        self.record(Call::Unpin {
            destination: destination.id,
            message,
        })
    }

    async fn delete(&self, destination: &Destination, message: MessageRef) -> GatewayResult<()> {
        self.record(Call::Delete {
            destination: destination.id,
            message,
        })
    }
}

// ============================================================================
// Clock driven by tokio time
// ============================================================================

/// Wall clock that moves with tokio's (possibly paused) clock
pub struct TokioClock {
    tz: Tz,
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(tz: Tz, base: DateTime<Utc>) -> Self {
        Self {
            tz,
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn timezone(&self) -> Tz {
        self.tz
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap();
        self.base + elapsed
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Config with no retry or removal delays
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.gateway.base_delay_ms = 0;
    config.gateway.rate_limit_buffer_ms = 0;
    config.cleanup.removal_pause_ms = 0;
    config
}

/// In-memory store, recording gateway and fixed clock wired like production
pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub gateway: Arc<RecordingGateway>,
    pub clock: Arc<FixedClock>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&test_config())
    }

    pub fn with_config(config: &Config) -> Self {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(FixedClock::new(TZ, start_time()));
        let services = Services::assemble(config, store.clone(), gateway.clone(), clock.clone());

        Self {
            store,
            gateway,
            clock,
            services,
        }
    }

    /// A group with `count` active destinations
    pub fn group(&self, count: usize) -> (GroupId, Vec<Destination>) {
        seed_group(self.store.as_ref(), count)
    }

    pub fn unit(&self, group_id: GroupId, ordinal: u32, mode: SelectionMode, policy: DeletePolicy) -> UnitId {
        seed_unit(self.store.as_ref(), group_id, ordinal, mode, policy)
    }

    pub fn content(&self, unit_id: UnitId, text: &str) -> ContentId {
        self.store
            .create_content(&NewContent::text(Some(unit_id), text))
            .unwrap()
    }

    /// Content ids currently live for the pair
    pub fn active_content(&self, destination_id: DestinationId, unit_id: UnitId) -> Vec<ContentId> {
        self.store
            .active_placements(destination_id, unit_id)
            .unwrap()
            .into_iter()
            .filter_map(|p| p.content_id)
            .collect()
    }
}

/// Group names and addresses are unique, so every seeded row gets a fresh suffix
static SEED_SEQ: AtomicI64 = AtomicI64::new(1);

pub fn seed_group(store: &dyn Store, count: usize) -> (GroupId, Vec<Destination>) {
    let group_seq = SEED_SEQ.fetch_add(1, Ordering::SeqCst);
    let group_id = store.create_group(&format!("test group {group_seq}")).unwrap();
    let destinations = (0..count)
        .map(|i| {
            let seq = SEED_SEQ.fetch_add(1, Ordering::SeqCst);
            let id = store
                .create_destination(&NewDestination::new(format!("-100{seq}"), format!("Channel {i}")))
                .unwrap();
            store.add_group_member(group_id, id).unwrap();
            store.destination(id).unwrap().unwrap()
        })
        .collect();
    (group_id, destinations)
}

pub fn seed_unit(
    store: &dyn Store,
    group_id: GroupId,
    ordinal: u32,
    mode: SelectionMode,
    policy: DeletePolicy,
) -> UnitId {
    let unit = NewUnit::new(group_id, ordinal, CronSchedule::parse("0 9 * * *").unwrap())
        .with_mode(mode)
        .with_delete_policy(policy);
    store.create_unit(&unit).unwrap()
}
