//! DOM extraction for option-chain pages
//!
//! This module provides the read-only view of the scraped page:
//! - ElementNode: Representation of DOM elements
//! - DomTree: The extracted chain table plus page metadata
//! - Row/cell helpers that treat `<table>` markup and ARIA grids alike

pub mod element;
pub mod tree;

pub use element::ElementNode;
pub use tree::{DomTree, PageMeta, header_row, row_cells, row_texts, table_rows};

use crate::error::{BridgeError, Result};
use headless_chrome::Tab;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An expiration offered by the chain page's selector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationRef {
    /// `YYYYMMDD` code used in the page's `series` parameter
    pub date_code: String,
    pub display_date: String,
}

/// Extract the chain DOM from a browser tab
pub fn extract_dom(tab: &Arc<Tab>) -> Result<DomTree> {
    DomTree::from_tab(tab)
}

/// List the expirations the page offers
pub fn extract_expirations(tab: &Arc<Tab>) -> Result<Vec<ExpirationRef>> {
    let result = tab
        .evaluate(include_str!("expirations.js"), false)
        .map_err(|e| BridgeError::EvaluationFailed(format!("Failed to list expirations: {}", e)))?;

    match result.value {
        Some(serde_json::Value::String(json)) => Ok(serde_json::from_str(&json)?),
        _ => Ok(Vec::new()),
    }
}

/// Whether the chain table has rendered rows
pub fn is_chain_ready(tab: &Arc<Tab>) -> Result<bool> {
    let result = tab
        .evaluate(include_str!("ready.js"), false)
        .map_err(|e| BridgeError::EvaluationFailed(format!("Failed to check table readiness: {}", e)))?;

    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
}
