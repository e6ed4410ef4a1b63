pub mod source;

pub use source::{resolve_script, Source};
