//! Record Persistence
//!
//! Envelope-based item storage over the KV store: small records inline,
//! large records chained through blob chunks.

mod item;

pub use item::{Envelope, ItemStorage, ENVELOPE_VERSION};
