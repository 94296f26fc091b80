mod machine;
mod parse;
mod session;
mod update;

pub use machine::SessionState;
pub use parse::parse_frame;
pub use session::{
    DEFAULT_ENDPOINT, SessionCommand, SessionConfig, SessionEvent, SessionHandle, spawn_session,
};
pub use update::{CanonicalUpdate, UpdateKind};
