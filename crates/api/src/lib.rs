// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Recoup API server library
//!
//! HTTP surface of the recovery engine: the gateway webhook receiver, the
//! email delivery-event callback, and the operator case routes.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
