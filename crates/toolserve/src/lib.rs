pub mod api;
pub mod cli;
pub mod logging;
pub mod request_id;
pub mod state;

pub use api::router;
pub use state::AppState;
