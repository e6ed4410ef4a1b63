pub mod cache;
pub mod models;

pub use cache::SourceCache;
pub use models::{resolve_script, Source};
