//! Domain types shared by every sync component.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Entity`] | Tracked subject with id `{type}_{exchange}_{code}` |
//! | [`IntervalLevel`] | Sampling granularity of fixed-cycle series |
//! | [`SessionRules`] | Exchange offset, close time and trading minutes |
//! | [`Timestamp`] | Exchange-local wall time of a record |
//! | [`RawRecord`] / [`PersistedRecord`] | Provider-native and canonical records |

mod entity;
mod level;
mod record;
mod session;
mod timestamp;

pub use entity::{Entity, EntityType};
pub use level::{IntervalLevel, PeriodCount};
pub use record::{FieldValue, PersistedRecord, RawRecord};
pub use session::SessionRules;
pub use timestamp::Timestamp;
