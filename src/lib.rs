//! Resumable chunked uploads: a durable client queue that slices files and
//! drains them over HTTP, and the server-side engine that reassembles them.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
