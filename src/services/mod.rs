pub mod credentials;
pub mod data_selector;
pub mod item_service;
pub mod notification;

pub use credentials::*;
pub use data_selector::*;
pub use item_service::*;
pub use notification::*;
