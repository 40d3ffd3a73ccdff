mod client;
mod csrf;
mod models;

pub use client::*;
pub use csrf::{extract_tokens, CsrfTokens};
pub use models::*;
