//! Adapters that move snapshots between a reporter and a parser.

pub mod file;
pub mod stream;

pub use file::{replay_file, FileMode, FileSnapshotSink, PeriodicFileReader};
pub use stream::{ReceiverOptions, StreamReceiver, StreamSnapshotSink};
