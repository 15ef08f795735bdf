pub mod config;
pub mod messages;
pub mod model;

pub use config::*;
pub use messages::*;
pub use model::*;
