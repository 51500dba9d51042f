//! Message routing between the page, popup and background contexts
//!
//! - [`message`]: the `{action, payload}` protocol and its replies
//! - [`host`]: what the background needs from the browser
//! - [`background`]: the coordinator owning the collection job

pub mod background;
pub mod host;
pub mod message;

pub use background::{Background, TabCommands};
pub use host::{TabHost, TabId, TabInfo};
pub use message::{
    CollectionEvent, Command, DestinationPayload, Message, PinnedTabPayload, Response, StrikeQuotes, protocol_schema,
};
