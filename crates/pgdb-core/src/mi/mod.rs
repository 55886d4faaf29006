//! GDB/MI parsing and the aggregated-record representation built on top of
//! it.

pub mod aggregate;
pub mod parser;
pub mod record;

pub use aggregate::{AggregatedRecord, ShapeMismatch, Substitution};
pub use parser::{parse_line, parse_stream};
pub use record::{Record, RecordType, Value};
