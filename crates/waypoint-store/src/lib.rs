pub mod conversations;
pub mod database;
pub mod deployments;
pub mod error;
pub mod messages;
pub mod projects;
pub mod row_helpers;
pub mod schema;
pub mod tasks;

pub use database::Database;
pub use error::StoreError;
