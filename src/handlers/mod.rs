pub mod health_handlers;
pub mod item_handlers;
pub mod upload_handlers;
