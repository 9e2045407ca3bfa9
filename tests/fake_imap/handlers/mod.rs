//! IMAP command handlers for the fake server.
//!
//! Each handler lives in its own module and processes a single IMAP
//! command (CAPABILITY, LOGIN, LIST, STATUS, EXAMINE, FETCH, LOGOUT).

mod capability;
mod list;
mod status;

pub use capability::handle_capability;
pub use examine::handle_examine;
pub use fetch::{FetchItems, handle_fetch};
pub use list::handle_list;
pub use login::handle_login;
pub use logout::handle_logout;
pub use status::handle_status;
