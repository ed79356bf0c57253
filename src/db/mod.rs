pub mod catalog;
pub mod connection;
pub mod models;
pub mod schema;

pub use catalog::DbError;
pub use connection::{
    create_pool, create_test_pool, database_url_from_path, run_migrations, DbPool,
    DbPooledConnection, MIGRATIONS,
};
