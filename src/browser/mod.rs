pub mod actions;
pub mod scripts;
pub mod session;

pub use session::{BrowserLifecycle, SharedBrowser, SubSession, SubSessionOptions};
