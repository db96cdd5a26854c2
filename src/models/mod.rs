//! Core data models for the object gateway.
//!
//! Listing entries and delete references serialize as tagged JSON variants;
//! multipart sessions map to the ledger tables via `sqlx::FromRow`.

pub mod credentials;
pub mod list_item;
pub mod multipart;
pub mod upload;
