pub mod cli;
pub mod config;
pub mod misp;

pub use config::{CertPolicy, MispAuth};
pub use misp::MispClient;
