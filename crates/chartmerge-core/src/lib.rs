pub mod config;
pub mod error;
pub mod logging;
pub mod resource;
pub mod session;
pub mod store;

pub use config::Settings;
pub use error::StoreError;
pub use resource::Resource;
pub use session::{ConflictState, MergeSession, SessionUpdate};
pub use store::{ResourceStore, SessionStore};
