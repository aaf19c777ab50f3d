pub mod config;
pub mod error;
pub mod messages;

pub use config::*;
pub use error::*;
pub use messages::*;
