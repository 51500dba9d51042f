pub mod durable;
pub mod market;
pub mod positions;

pub use durable::{DurableStore, FileStore, MemoryStore, get_json, set_json};
pub use market::{UnderlyingMap, load_full_chain, load_underlying, save_full_chain, set_underlying, underlying_price};
pub use positions::{NewPosition, PositionStore};
