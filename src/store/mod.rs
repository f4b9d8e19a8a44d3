pub mod connection;
pub mod helper;
pub mod merge_sql;
pub mod mysql;
pub mod schema;
pub mod traits;

pub use connection::*;
pub use helper::*;
pub use merge_sql::*;
pub use mysql::*;
pub use traits::*;
