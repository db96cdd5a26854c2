//! Object storage gateway: folder-style listing, folder markers, bulk
//! deletion, single and chunked uploads and presigned download URLs on top
//! of an S3-compatible bucket.

pub mod backend;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
