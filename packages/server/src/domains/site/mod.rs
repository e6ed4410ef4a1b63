pub mod models;
pub mod reconciler;

pub use models::{AlertMode, Site};
pub use reconciler::SiteTaskReconciler;
