pub mod deform;
pub mod detection;
pub mod landmarks;
pub mod overlay;
pub mod params;
pub mod render;
pub mod runtime;
pub mod stream;
pub mod video;

// Re-export the top-level pipeline error type so callers only need `avatar_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;
