use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Represents a DOM element node of the scraped page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ElementNode {
    /// HTML tag name (e.g., "table", "tr", "div")
    pub tag_name: String,

    /// Element attributes (e.g., class, role, data-field)
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Own text content of the element (not including children)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,

    /// Child elements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementNode>,
}

impl ElementNode {
    /// Create a new ElementNode
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            ..Default::default()
        }
    }

    /// Builder method: set text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    /// Builder method: set children
    pub fn with_children(mut self, children: Vec<ElementNode>) -> Self {
        self.children = children;
        self
    }

    /// Builder method: add one attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_attribute(key, value);
        self
    }

    /// Add a single attribute
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Add a child element
    pub fn add_child(&mut self, child: ElementNode) {
        self.children.push(child);
    }

    /// Get attribute value by key
    pub fn get_attribute(&self, key: &str) -> Option<&String> {
        self.attributes.get(key)
    }

    /// Check if element has a specific class
    pub fn has_class(&self, class_name: &str) -> bool {
        if let Some(classes) = self.attributes.get("class") {
            classes.split_whitespace().any(|c| c == class_name)
        } else {
            false
        }
    }

    /// Check if any class contains the given fragment (obfuscated class names)
    pub fn class_contains(&self, fragment: &str) -> bool {
        self.attributes
            .get("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c.contains(fragment)))
    }

    /// Check if element is a specific tag
    pub fn is_tag(&self, tag: &str) -> bool {
        self.tag_name.eq_ignore_ascii_case(tag)
    }

    /// ARIA role, if any
    pub fn role(&self) -> Option<&str> {
        self.attributes.get("role").map(String::as_str)
    }

    pub fn is_table(&self) -> bool {
        self.is_tag("table") || matches!(self.role(), Some("table" | "grid" | "treegrid"))
    }

    pub fn is_row(&self) -> bool {
        self.is_tag("tr") || self.role() == Some("row")
    }

    pub fn is_header_cell(&self) -> bool {
        self.is_tag("th") || self.role() == Some("columnheader")
    }

    pub fn is_cell(&self) -> bool {
        self.is_tag("td") || matches!(self.role(), Some("cell" | "gridcell" | "rowheader")) || self.is_header_cell()
    }

    /// Whether the element is hidden by attribute
    pub fn is_hidden(&self) -> bool {
        self.attributes.contains_key("hidden") || self.get_attribute("aria-hidden").is_some_and(|v| v == "true")
    }

    /// Concatenated text of this element and all descendants, whitespace-normalized
    pub fn text(&self) -> String {
        let mut raw = String::new();
        self.collect_text(&mut raw);
        raw.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text_content {
            out.push(' ');
            out.push_str(text);
        }
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Depth-first search for the first element matching the predicate
    pub fn find<P>(&self, predicate: P) -> Option<&ElementNode>
    where
        P: Fn(&ElementNode) -> bool + Copy,
    {
        if predicate(self) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(predicate))
    }

    /// All matching elements in document order, not descending into matches
    pub fn find_all<P>(&self, predicate: P) -> Vec<&ElementNode>
    where
        P: Fn(&ElementNode) -> bool + Copy,
    {
        let mut found = Vec::new();
        self.collect_matches(predicate, &mut found);
        found
    }

    fn collect_matches<'a, P>(&'a self, predicate: P, found: &mut Vec<&'a ElementNode>)
    where
        P: Fn(&ElementNode) -> bool + Copy,
    {
        for child in &self.children {
            if predicate(child) {
                found.push(child);
            } else {
                child.collect_matches(predicate, found);
            }
        }
    }

    /// Simplify element by removing unnecessary children (like scripts, styles)
    pub fn simplify(&mut self) {
        self.children.retain(|child| {
            !matches!(child.tag_name.as_str(), "script" | "style" | "noscript" | "svg")
        });

        for child in &mut self.children {
            child.simplify();
        }
    }
}
