//! HTTP handlers outside the webhook path

pub mod status;

pub use status::{status_router, ServiceStats, StatusState};
