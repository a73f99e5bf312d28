pub mod db;
pub mod error;
pub mod manager;
pub mod transcript;
pub mod types;

pub use error::SessionError;
pub use manager::SessionManager;
pub use transcript::{MessageRecord, TranscriptRecord, TranscriptStore, CURRENT_SESSION_VERSION};
pub use types::{Session, SessionKey};
