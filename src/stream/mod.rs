pub mod encoder;
pub mod http;

pub use encoder::StreamEncoder;
pub use http::{create_router, AppState};
