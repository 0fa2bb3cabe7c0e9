//! Volumetric segmentation over HTTP.
//!
//! Uploaded NIfTI scans are segmented by an external model in a per-request
//! session directory; results are fetched through short-lived download links.

pub mod api;
pub mod auth;
pub mod config;
pub mod imaging;
pub mod pipeline;
pub mod segmentation;
pub mod session;
