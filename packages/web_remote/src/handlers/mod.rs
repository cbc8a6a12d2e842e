pub mod frontend;
pub mod health;
pub mod instances;
pub mod remotes;

// Re-export all handlers for easy route registration
pub use frontend::{frontend_ws_handler, root_handler};
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use instances::list_instances;
pub use remotes::list_remotes;
