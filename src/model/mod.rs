pub mod change_log;
pub mod error;
pub mod item;
pub mod mapping;
pub mod queue;
pub mod result;
pub mod settings;
pub mod tables;
pub mod value;

pub use change_log::*;
pub use error::*;
pub use item::*;
pub use mapping::*;
pub use queue::*;
pub use result::*;
pub use settings::*;
pub use value::*;
