//! fabriclog-output — routes decoded ledger records to a sink.
//!
//! ```text
//! DecodedRecord ─► Router (label by kind) ─► Sink
//!                                             ├── HecSink      (queued, batched POSTs)
//!                                             ├── FileSink     (one file per record)
//!                                             ├── ConsoleSink  (JSON lines on stdout)
//!                                             └── NullSink
//! ```

pub mod console;
pub mod file;
pub mod hec;
pub mod router;
pub mod sink;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use hec::{HecConfig, HecSink};
pub use router::{Router, RouterConfig, SourceTypes, DEFAULT_SOURCETYPE_PREFIX};
pub use sink::{EventMetadata, MemorySink, NullSink, OutputEvent, OutputMetrics, Sink};
