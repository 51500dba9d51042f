pub mod adapters;
pub mod config;
pub mod session;

pub use adapters::{ChromeChain, ChromeHost, TabLocalStorage};
pub use config::{ConnectionOptions, LaunchOptions};
pub use session::BrowserSession;
