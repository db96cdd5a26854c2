pub mod gateway_service;
pub mod multipart_coordinator;
pub mod session_table;
pub mod upload_ledger;
pub mod upload_sweeper;
