pub mod allowlist;
pub mod ioc;
pub mod rule;
pub mod seen_domain;

pub use allowlist::DomainAllowlist;
pub use ioc::Ioc;
pub use rule::Rule;
pub use seen_domain::SeenDomain;
