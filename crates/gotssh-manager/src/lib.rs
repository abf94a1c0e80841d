//! gotssh-manager: named SSH sessions and the forwards riding on them
//!
//! - [`SessionRegistry`]: alias -> [`Session`] directory
//! - [`ConnectionManager`]: connect, retry, disconnect, reconnect, remove
//! - [`ForwardEngine`]: local, remote and dynamic (SOCKS5) forwards
//! - [`GotsshState`]: the process-wide bundle of the above

pub mod forward;
mod health;
pub mod manager;
pub mod registry;
pub mod session;
pub mod state;

pub use forward::{ForwardEngine, ForwardRule};
pub use manager::ConnectionManager;
pub use registry::SessionRegistry;
pub use session::{Session, SessionStatus};
pub use state::GotsshState;
