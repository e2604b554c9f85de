pub mod client_id;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod server;
pub mod throttle;
pub mod upstream;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use handlers::AppState;
pub use server::create_app;
pub use throttle::{Admission, QuotaStatus, Throttle, ThrottleSettings};
