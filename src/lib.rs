#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! log-shipper ships application log events to a log-group/stream service, a
//! partitioned record stream, or a pub/sub topic service.
//!
//! A log **message** is enqueued onto a bounded, discard-policy [`queue`]. A
//! background **writer** (see [`writer`]) drains the queue in batches sized
//! to the destination's own limits (see [`batch`]), sends each batch through
//! a narrow [`facade`] that maps service errors onto a small reason-code
//! taxonomy, and applies a shared retry/backoff policy (see [`retry`]) for
//! throttling, sequence-token races, and missing destinations. Per-writer
//! counters are exposed through [`stats`].
//!
//! [`config`] loads and validates a YAML file describing one or more named
//! destinations. [`engine`] starts one writer per destination and
//! coordinates their shutdown; [`shutdown`] wires that coordination to a
//! process-wide Ctrl+C / SIGTERM hook.
//!
//! [`task`], [`signal`], and [`context`] are the shared plumbing underneath:
//! background-task registration/joining, a cooperative stop signal, and a
//! typed bag of initialization collaborators, respectively.

pub use batch;
pub use config;
pub use context;
pub use engine;
pub use facade;
pub use queue;
pub use retry;
pub use shutdown;
pub use signal;
pub use stats;
pub use task;
pub use writer;
