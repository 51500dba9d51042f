//! Option-chain scraping
//!
//! - [`columns`]: header discovery with a fixed-offset fallback
//! - [`row`]: row parsing that degrades to zeros instead of failing
//! - [`number`]: tolerant numeric cell parsing
//! - [`page`]: one pass over a chain page
//! - [`url`]: chain page addressing by series and expiration

pub mod columns;
pub mod number;
pub mod page;
pub mod row;
pub mod url;

pub use columns::{ColumnLayout, ColumnMap, SideColumns, map_columns, map_table};
pub use number::parse_number;
pub use page::{ParsedPage, parse_chain, parse_table};
pub use row::{RowQuotes, parse_row, parse_row_with_layout};
pub use url::{ChainUrl, chain_url};
