pub const REFERENCE_CONFIG: &'static str = include_str!("../reference.toml");

pub mod address;
pub mod cluster_view;
pub mod config;
pub mod error;
pub mod ext;
pub mod member;
pub mod message;
pub mod partition;
