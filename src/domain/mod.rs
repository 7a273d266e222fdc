//! Core domain types for the volley batching system.
//!
//! Pure data with no scheduling or transport dependencies:
//! - Uploaded files and chat/message handles
//! - Batches, their run phase and the user-facing status view

pub mod batch;
pub mod file;
