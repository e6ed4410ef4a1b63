//! Rules evaluation: caches, extraction, pipeline, orchestration.

pub mod caches;
pub mod extractor;
pub mod filter;
pub mod models;
pub mod orchestrator;
pub mod pipeline;

pub use caches::{
    ioc_key, unknown_domain_key, AlertOnceCache, IocLookupCache, Scope, SeenDomainsCache,
    DEFAULT_ALERT_TTL,
};
pub use extractor::{normalize_domain, ExtractError, FileEventExtractor, NetworkEventExtractor};
pub use filter::{EventFilter, DEFAULT_PROCESSABLE_TYPES};
pub use models::{DomainAllowlist, Ioc, Rule, SeenDomain};
pub use orchestrator::{
    AlertModeResolver, EnqueueRulesRequest, RulesError, RulesJobHandler, RulesJobPayload,
    RulesOrchestrator, RulesOrchestratorOptions, SiteAlertModeResolver,
};
pub use pipeline::{Decision, PipelineContext, ProcessingResults, RulesPipeline};
