//! camstream HTTP and WebSocket surface

pub mod camera_service;
pub mod http;
pub mod ws;

pub use camera_service::CameraServiceClient;
pub use http::{create_router, AppError, AppResult, AppState};
