//! In-memory capability providers.
//!
//! - `StaticSource` - returns configured records, standing in for a data connector
//! - `RecordingSink` - records deliveries, standing in for email/chat/CRM actions
//!
//! Both are used by demos and tests; real integrations live outside this workspace.

mod recording_sink;
mod static_source;

pub use self::recording_sink::{Delivery, RecordingSink};
pub use self::static_source::StaticSource;
