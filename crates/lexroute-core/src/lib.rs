pub mod assignment;
pub mod config;
pub mod db;
pub mod escalation;
pub mod oracle;
pub mod pipeline;
pub mod stages;
pub mod types;

pub use types::*;
