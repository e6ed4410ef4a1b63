pub mod dispatcher;
pub mod models;
pub mod service;

pub use dispatcher::{AlertDispatcher, DispatchError, SinkPayload};
pub use models::{Alert, AlertStats, CreateAlertRequest, DeliveryStatus, ListAlertsOptions};
pub use service::AlertService;
