pub mod models;
pub mod refresh;

pub use models::{substitute_placeholders, RefreshStatus, Secret};
pub use refresh::{refresh_task_name, SecretRefreshHandler, SecretRefreshScheduler};
