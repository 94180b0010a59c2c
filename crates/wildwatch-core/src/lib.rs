//! wildwatch-core - Core library for Wildwatch
//!
//! This crate contains the submission models, libSQL storage, the Kobo
//! Toolbox gateway, form parsing, and the sync reconciler used by the API
//! server and the CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod forms;
pub mod kobo;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, FieldErrors, Result};
pub use models::{Submission, SubmissionId};
