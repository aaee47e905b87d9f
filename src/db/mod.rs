pub mod images;
mod migrate;
mod pool;
mod schema;

pub use images::ImageRow;
pub use migrate::Migrator;
pub use pool::{ConnectionPool, PooledConnection};
pub use schema::{current_version, thumb_table, MigrationStep, LADDER, MIGRATIONS};
