//! Client module for the remote data API.
//!
//! This module provides the `DataApiClient` for table-style filtered reads,
//! row writes and named remote procedure calls (nearby search, impact stats,
//! profile languages) against the backend.
//!
//! Requests authenticate with the project API key plus the signed-in user's
//! bearer token.

pub mod client;
pub mod error;
pub mod filter;

pub use client::DataApiClient;
pub use error::ApiError;
pub use filter::Filter;
