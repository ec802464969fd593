pub mod error;
pub mod eviction;
pub mod fanout;
pub mod handlers;
pub mod observability;
pub mod pipeline;
pub mod presence;
pub mod registry;
pub mod router;
pub mod socket;
pub mod state;
pub mod types;

pub use error::AppError;
pub use state::{AppState, build_state};

#[cfg(test)]
pub mod test_support;
