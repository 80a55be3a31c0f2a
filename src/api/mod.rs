//! HTTP control surface.

pub mod error;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::{router, AppState};
