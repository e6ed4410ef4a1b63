pub mod http_alert_sink;

pub use http_alert_sink::HttpAlertSink;
