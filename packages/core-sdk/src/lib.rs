pub mod architect;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod fanout;
pub mod models;
pub mod server;
pub mod sse;
pub mod storyboard;
pub mod telemetry;

#[cfg(test)]
mod testing;

/**
 * \brief SDK 预导入集合，方便外部引用常用类型。
 */
pub mod prelude {
    pub use crate::architect::ArchitectSession;
    pub use crate::client::ProviderClient;
    pub use crate::config::{MemoryStore, Session, SettingsStore};
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::fanout::{compare_models, fan_out, Slot};
    pub use crate::models::*;
    pub use crate::sse::{Completion, Finish};
    pub use crate::storyboard::{Storyboard, StoryboardOptions};
    pub use crate::{db, server, telemetry};
}
