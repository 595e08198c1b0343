pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod extract;
pub mod legacy;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod server;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::auth;
    pub use crate::chat;
    pub use crate::config;
    pub use crate::db;
    pub use crate::extract;
    pub use crate::legacy;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::prompt;
    pub use crate::server;
    pub use crate::telemetry;
}
