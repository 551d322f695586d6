//! Testing utilities and mock implementations of the pipeline collaborators.
//!
//! Lets the orchestrator be driven end to end without a database or any
//! HTTP service.
//!
//! # Example
//!
//! ```rust,ignore
//! use leadflow_core::testing::{fixtures, InMemoryDenylist, MockEnricher, MockSourceStore};
//!
//! let source = MockSourceStore::new(fixtures::lead_records(100));
//! let enricher = MockEnricher::new().with_failing_rows([7]);
//! let denylist = InMemoryDenylist::new([fixtures::phone_for_row(15)]);
//! ```

mod mock_denylist;
mod mock_lookup;
mod mock_progress;
mod mock_sink;
mod mock_source;

pub use mock_denylist::InMemoryDenylist;
pub use mock_lookup::{MockEnricher, MockLitigatorScreen};
pub use mock_progress::RecordingProgressSink;
pub use mock_sink::{MockRecordSink, PersistedRecord};
pub use mock_source::MockSourceStore;

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::record::Record;

    /// Ten-digit phone number unique to `row`.
    pub fn phone_for_row(row: usize) -> String {
        format!("555{:07}", row)
    }

    /// A lead with a name and a single phone.
    pub fn lead_record(row: usize) -> Record {
        Record::new(row)
            .with_field("first_name", format!("Lead{}", row))
            .with_field("last_name", "Example")
            .with_field("phone_1", phone_for_row(row))
    }

    /// `count` leads with rows `0..count`.
    pub fn lead_records(count: usize) -> Vec<Record> {
        (0..count).map(lead_record).collect()
    }

    /// Phones of the rows selected by `pick` among `0..count`.
    pub fn phones_where(count: usize, pick: impl Fn(usize) -> bool) -> Vec<String> {
        (0..count).filter(|r| pick(*r)).map(phone_for_row).collect()
    }
}
