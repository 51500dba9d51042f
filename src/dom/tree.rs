use crate::dom::element::ElementNode;
use crate::error::{BridgeError, Result};
use headless_chrome::Tab;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Page-level facts captured next to the DOM
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    #[serde(default)]
    pub url: String,

    /// Selected expiration as displayed by the page
    #[serde(default)]
    pub expiration: Option<String>,

    /// Raw text of the underlying price widget
    #[serde(default)]
    pub underlying: Option<String>,
}

/// Represents the DOM of an option-chain page
#[derive(Debug, Clone)]
pub struct DomTree {
    /// Root element of the DOM tree
    pub root: ElementNode,

    pub meta: PageMeta,
}

#[derive(Deserialize)]
struct Extracted {
    #[serde(flatten)]
    meta: PageMeta,
    root: ElementNode,
}

impl DomTree {
    /// Create a new DomTree without page metadata
    pub fn new(root: ElementNode) -> Self {
        Self {
            root,
            meta: PageMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: PageMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Build DOM tree from a browser tab
    pub fn from_tab(tab: &Arc<Tab>) -> Result<Self> {
        // The script returns a JSON string with the page metadata and the simplified body
        let js_code = include_str!("extract_chain.js");

        let result = tab
            .evaluate(js_code, false)
            .map_err(|e| BridgeError::EvaluationFailed(format!("Failed to execute DOM extraction script: {}", e)))?;

        let json_value = result
            .value
            .ok_or_else(|| BridgeError::EvaluationFailed("No value returned from DOM extraction".to_string()))?;

        let json_str: String = serde_json::from_value(json_value)
            .map_err(|e| BridgeError::EvaluationFailed(format!("Failed to get JSON string: {}", e)))?;

        Self::from_json(&json_str)
    }

    /// Parse a dump produced by the extraction script
    pub fn from_json(json: &str) -> Result<Self> {
        let extracted: Extracted = serde_json::from_str(json)?;
        let mut tree = Self::new(extracted.root).with_meta(extracted.meta);
        tree.simplify();
        Ok(tree)
    }

    /// Simplify the DOM tree by removing unnecessary elements
    pub fn simplify(&mut self) {
        self.root.simplify();
    }

    /// First table-like element in the tree
    pub fn find_table(&self) -> Option<&ElementNode> {
        self.root.find(ElementNode::is_table)
    }

    /// Convert the DOM tree to JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.root)?)
    }

    /// Count total elements in the tree
    pub fn count_elements(&self) -> usize {
        Self::count_elements_recursive(&self.root)
    }

    fn count_elements_recursive(node: &ElementNode) -> usize {
        1 + node.children.iter().map(Self::count_elements_recursive).sum::<usize>()
    }
}

/// Visible rows of a table, in document order
pub fn table_rows(table: &ElementNode) -> Vec<&ElementNode> {
    table
        .find_all(ElementNode::is_row)
        .into_iter()
        .filter(|row| !row.is_hidden())
        .collect()
}

/// Cells of a row, in document order
pub fn row_cells(row: &ElementNode) -> Vec<&ElementNode> {
    row.find_all(ElementNode::is_cell)
}

/// Text of every cell of a row
pub fn row_texts(row: &ElementNode) -> Vec<String> {
    row_cells(row).into_iter().map(ElementNode::text).collect()
}

/// Header row: a row made of header cells, or the first row under `thead`
pub fn header_row(table: &ElementNode) -> Option<&ElementNode> {
    let rows = table_rows(table);
    rows.iter()
        .copied()
        .find(|row| {
            let cells = row_cells(row);
            !cells.is_empty() && cells.iter().all(|c| c.is_header_cell())
        })
        .or_else(|| {
            table
                .find(|n| n.is_tag("thead"))
                .and_then(|head| head.find(ElementNode::is_row))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(tag: &str, text: &str) -> ElementNode {
        ElementNode::new(tag).with_text(text)
    }

    fn create_test_tree() -> ElementNode {
        let header = ElementNode::new("tr").with_children(vec![cell("th", "Bid"), cell("th", "Strike"), cell("th", "Bid")]);
        let row = ElementNode::new("tr").with_children(vec![cell("td", "1.0"), cell("td", "100"), cell("td", "2.0")]);
        let hidden = ElementNode::new("tr").with_attribute("hidden", "").with_children(vec![cell("td", "x")]);

        ElementNode::new("body").with_children(vec![
            ElementNode::new("script").with_text("var x = 1;"),
            ElementNode::new("table").with_children(vec![
                ElementNode::new("thead").with_children(vec![header]),
                ElementNode::new("tbody").with_children(vec![row, hidden]),
            ]),
        ])
    }

    #[test]
    fn test_find_table_and_rows() {
        let tree = DomTree::new(create_test_tree());
        let table = tree.find_table().expect("table");

        let rows = table_rows(table);
        assert_eq!(rows.len(), 2);
        assert_eq!(row_texts(rows[1]), vec!["1.0", "100", "2.0"]);
    }

    #[test]
    fn test_header_row() {
        let tree = DomTree::new(create_test_tree());
        let table = tree.find_table().unwrap();
        let header = header_row(table).expect("header");
        assert_eq!(row_texts(header), vec!["Bid", "Strike", "Bid"]);
    }

    #[test]
    fn test_header_row_absent() {
        let table = ElementNode::new("div").with_attribute("role", "grid").with_children(vec![
            ElementNode::new("div")
                .with_attribute("role", "row")
                .with_children(vec![ElementNode::new("div").with_attribute("role", "cell").with_text("5")]),
        ]);
        assert!(header_row(&table).is_none());
    }

    #[test]
    fn test_from_json_simplifies() {
        let json = serde_json::json!({
            "url": "https://www.tradingview.com/options/chain/CME_MINI-ESH2026/",
            "expiration": "Jan 16",
            "underlying": "6,910.75",
            "root": create_test_tree(),
        })
        .to_string();

        let tree = DomTree::from_json(&json).unwrap();
        assert_eq!(tree.meta.expiration.as_deref(), Some("Jan 16"));
        assert_eq!(tree.meta.underlying.as_deref(), Some("6,910.75"));
        assert!(tree.root.find(|n| n.is_tag("script")).is_none());
        assert!(tree.find_table().is_some());
    }

    #[test]
    fn test_count_elements() {
        let tree = DomTree::new(create_test_tree());
        // body, script, table, thead, tr, 3 th, tbody, tr, 3 td, tr, td
        assert_eq!(tree.count_elements(), 15);
    }
}
