//! Service wrappers shared by Wildwatch binaries

mod database;

pub use database::DatabaseService;
