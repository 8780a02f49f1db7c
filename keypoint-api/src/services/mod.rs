//! Service Layer
//!
//! Business logic kept out of route handlers.

mod process_image_service;

pub use process_image_service::*;
