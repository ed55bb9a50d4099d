//! HTTP transport: inbound webhook server and outbound callback delivery

mod client;
mod server;

pub use client::HttpTransport;
pub use server::{create_router, ApiState};
