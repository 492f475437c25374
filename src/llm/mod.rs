pub mod client;
pub mod description;

pub use client::{ChatClient, LlmConfig};
pub use description::DescriptionGenerator;
