//! REST API client for the chat backend
//!
//! Sends go through REST; the socket only carries broadcasts back.

pub mod client;

pub use client::ApiClient;
