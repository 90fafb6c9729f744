pub mod app;
pub mod notification;
pub mod transaction;

pub use app::{add_routes, AppState};
