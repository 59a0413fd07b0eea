//! Client-side Nostr relay runtime.
//!
//! The crate is layered bottom-up:
//!
//! - [`channel`] and [`context`]: bounded MPMC channels with `select`, and
//!   cancellation trees. Everything above talks through these.
//! - [`connection`]: one WebSocket (or in-process test transport) with a
//!   send and a receive queue.
//! - [`relay`]: connection state machine with reconnect/backoff, NIP-01
//!   publish and subscribe, NIP-42 auth, NIP-45 COUNT and NIP-11 limits.
//! - [`subscription`]: REQ lifecycle with `events`/`eose`/`closed` channels.
//! - [`pool`]: a relay fleet with fan-out subscriptions, cross-relay dedup,
//!   cache-first queries and quorum completion; [`batcher`] merges
//!   concurrent queries into shared REQs.
//!
//! [`mock`] provides an in-process relay for tests; it is reachable when
//! [`Config::test_mode`] is set.
//!
//! ```no_run
//! # async fn demo() -> pika_relay_runtime::Result<()> {
//! use std::sync::Arc;
//! use pika_relay_runtime::{Config, Context, Filter, Pool};
//!
//! let pool = Pool::new(Arc::new(Config::from_env()));
//! let events = pool
//!     .query_single(&Context::background(), &["wss://relay.damus.io"], Filter::new().kind(1).limit(10))
//!     .await?;
//! println!("{} notes", events.len());
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod brown_list;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod envelope;
pub mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod mock;
pub mod nip11;
pub mod pool;
pub mod relay;
pub mod sub_registry;
pub mod subscription;

pub use self::batcher::{BatcherStats, QueryBatcher};
pub use self::brown_list::{BrownList, BrownListStats};
pub use self::channel::{Channel, Select};
pub use self::config::Config;
pub use self::context::{CancelHandle, Context};
pub use self::envelope::Envelope;
pub use self::error::{Error, ErrorKind, Result};
pub use self::event::{Event, EventSigner, EventTemplate};
pub use self::filter::{Filter, Filters};
pub use self::metrics::{Counter, Metrics};
pub use self::nip11::{RelayInformation, RelayLimitation};
pub use self::pool::{Pool, PoolSubscription};
pub use self::relay::{Relay, RelayStatus};
pub use self::sub_registry::{QueueMetrics, SubKind, SubRegistry};
pub use self::subscription::{SubState, Subscription, SubscriptionOptions};
