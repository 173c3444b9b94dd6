pub mod config;
pub mod control;
pub mod framing;
pub mod mux;

pub use config::*;
pub use control::*;
pub use framing::*;
pub use mux::*;
