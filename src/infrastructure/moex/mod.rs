pub mod client;

pub use client::{MoexClient, MoexClientConfig};
