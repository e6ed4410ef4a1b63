pub mod alert;

pub use alert::{Alert, AlertStats, CreateAlertRequest, DeliveryStatus, ListAlertsOptions};
