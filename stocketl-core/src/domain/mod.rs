//! Domain types for the stock ETL pipeline.

pub mod record;
pub mod source;
pub mod window;

pub use record::{normalize_date, CleanRecord, MergedRecord, RawRecord};
pub use source::{MergedSource, Source, UnknownSource};
pub use window::DateWindow;
