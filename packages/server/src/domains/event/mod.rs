pub mod ingest;
pub mod models;

pub use ingest::EventIngestor;
pub use models::Event;
