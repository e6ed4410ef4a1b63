// Kernel - core infrastructure with dependency injection
//
// The kernel holds the shared machinery (database-backed queue, scheduler,
// caches, notifications) and provides dependency injection through traits
// for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers.

pub mod cache;
pub mod deps;
pub mod http;
pub mod jobs;
pub mod notify;
pub mod scheduler;
pub mod service_host;
pub mod traits;

pub use cache::InMemorySharedCache;
pub use deps::ServerDeps;
pub use http::{ReqwestHttpSender, TestHttpSender};
pub use notify::{BaseJobNotifier, NatsJobNotifier, NullJobNotifier, TestJobNotifier};
pub use service_host::{Service, ServiceHost};
pub use traits::*;
