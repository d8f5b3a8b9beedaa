//! Lectern core session types and utilities

pub mod config;
pub mod error;
pub mod session;
pub mod storage;
pub mod store;
pub mod token;

pub use config::{
    ApiConfig, EndpointConfig, ExpiryConfig, NotificationConfig, SessionConfig, StorageConfig,
};
pub use error::{CoreError, CoreResult};
pub use session::{Session, UserProfile};
pub use storage::{DurableStorage, FileStorage, MemoryStorage};
pub use store::SessionStore;
pub use token::{TokenInspector, decode_expiry};
