pub mod site;

pub use site::{AlertMode, Site};
