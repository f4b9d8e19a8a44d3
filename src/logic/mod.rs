pub mod clone;
pub mod create;
pub mod delete;
pub mod lifecycle;
pub mod locks;
pub mod merge;
pub mod orchestrator;
pub mod replay;
pub mod scheduler;
pub mod seed;

pub use clone::*;
pub use create::*;
pub use delete::*;
pub use lifecycle::*;
pub use locks::*;
pub use merge::*;
pub use orchestrator::*;
pub use replay::*;
pub use scheduler::*;
pub use seed::*;
