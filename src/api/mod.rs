//! HTTP management API consumed by the dashboard

mod error;
mod handlers;
mod server;

pub use error::{ApiError, ApiResult};
pub use server::{router, serve, ApiState, DEFAULT_TEST_TIMEOUT};
