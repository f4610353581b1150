// StreamRelay API Library
//
// HTTP and WebSocket surface in front of the relay coordinator

pub mod http;

pub use http::{create_router, AppState};
