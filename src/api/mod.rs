//! HTTP API.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, SegmentResponse};
pub use routes::create_router;
pub use state::AppState;
