pub mod compiler;
pub mod models;

pub use compiler::{PreparedRequest, RequestSummary, SinkCompiler, TestFireResult};
pub use models::HttpAlertSink;
