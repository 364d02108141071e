pub mod db;
pub mod error;
pub mod manager;
pub mod store;
pub mod types;

pub use error::SessionError;
pub use manager::SessionManager;
pub use store::{NewMessage, SessionStore};
pub use types::{
    compress_tier, Message, Role, Session, SessionKey, Summary, ToolCall, ToolResultEntry,
    MARKER_EARLIER, MARKER_RECENT, MARKER_SEPARATOR, SUMMARY_MAX_CHARS,
};
