pub mod secret;

pub use secret::{substitute_placeholders, RefreshStatus, Secret};
