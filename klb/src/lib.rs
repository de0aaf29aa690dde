pub mod affinity;
pub mod api;
pub mod config;
pub mod conntrack;
pub mod daemon;
pub mod error;
pub mod loader;
pub mod maglev;
pub mod maps;
pub mod net;
pub mod state;
pub mod sync;

pub use error::{Error, Result};
