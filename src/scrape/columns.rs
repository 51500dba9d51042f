//! Column discovery for the chain table
//!
//! Headers left of "Strike" belong to calls, headers right of it to puts.
//! When the header row is hidden or virtualized away, the layout falls back to
//! fixed per-side offsets from the strike column.

use crate::dom::{DomTree, ElementNode, header_row, row_cells, table_rows};
use serde::{Deserialize, Serialize};

/// Signed distance of each sub-column from the strike column, used without headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideOffsets {
    pub bid: isize,
    pub ask: isize,
    pub price: isize,
    pub volume: isize,
    pub delta: isize,
    pub gamma: isize,
    pub theta: isize,
    pub vega: isize,
    pub rho: isize,
}

/// `Price | Ask | Bid | Volume | Strike | IV | Volume | Bid | Ask | Price`, with
/// call greeks further left and put greeks further right
pub const CALL_OFFSETS: SideOffsets = SideOffsets {
    price: -4,
    ask: -3,
    bid: -2,
    volume: -1,
    delta: -5,
    gamma: -6,
    theta: -7,
    vega: -8,
    rho: -9,
};

pub const PUT_OFFSETS: SideOffsets = SideOffsets {
    volume: 2,
    bid: 3,
    ask: 4,
    price: 5,
    delta: 7,
    gamma: 8,
    theta: 9,
    vega: 10,
    rho: 11,
};

/// One IV column right of the strike serves both sides
pub const SHARED_IV_OFFSET: isize = 1;

/// Cell indices of one side's sub-columns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideColumns {
    pub bid: Option<usize>,
    pub ask: Option<usize>,
    pub price: Option<usize>,
    pub volume: Option<usize>,
    pub iv: Option<usize>,
    pub delta: Option<usize>,
    pub gamma: Option<usize>,
    pub theta: Option<usize>,
    pub vega: Option<usize>,
    pub rho: Option<usize>,
}

impl SideColumns {
    fn indices(&self) -> [Option<usize>; 10] {
        [
            self.bid, self.ask, self.price, self.volume, self.iv, self.delta, self.gamma, self.theta, self.vega,
            self.rho,
        ]
    }

    /// Highest mapped cell index, if any
    pub fn max_index(&self) -> Option<usize> {
        self.indices().into_iter().flatten().max()
    }

    pub fn is_empty(&self) -> bool {
        self.max_index().is_none()
    }

    /// Assign a header label to its slot; first occurrence wins
    fn assign(&mut self, label: &str, index: usize) -> bool {
        let slot = match classify_label(label) {
            Some(Label::Bid) => &mut self.bid,
            Some(Label::Ask) => &mut self.ask,
            Some(Label::Price) => &mut self.price,
            Some(Label::Volume) => &mut self.volume,
            Some(Label::Iv) => &mut self.iv,
            Some(Label::Delta) => &mut self.delta,
            Some(Label::Gamma) => &mut self.gamma,
            Some(Label::Theta) => &mut self.theta,
            Some(Label::Vega) => &mut self.vega,
            Some(Label::Rho) => &mut self.rho,
            Some(Label::Strike) | None => return false,
        };
        if slot.is_none() {
            *slot = Some(index);
            true
        } else {
            false
        }
    }

    /// Fixed offsets around `strike_index`; columns left of the row start are unmapped
    fn from_offsets(strike_index: usize, offsets: &SideOffsets) -> Self {
        let at = |offset: isize| strike_index.checked_add_signed(offset);
        Self {
            bid: at(offsets.bid),
            ask: at(offsets.ask),
            price: at(offsets.price),
            volume: at(offsets.volume),
            iv: at(SHARED_IV_OFFSET),
            delta: at(offsets.delta),
            gamma: at(offsets.gamma),
            theta: at(offsets.theta),
            vega: at(offsets.vega),
            rho: at(offsets.rho),
        }
    }
}

/// Resolved cell indices for both sides of a strike
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMap {
    pub strike_index: usize,
    pub call: SideColumns,
    pub put: SideColumns,
}

impl ColumnMap {
    /// Map header labels to columns. `None` if there is no strike header.
    pub fn from_headers<S: AsRef<str>>(headers: &[S]) -> Option<Self> {
        let strike_index = headers
            .iter()
            .position(|h| classify_label(h.as_ref()) == Some(Label::Strike))?;

        let mut map = ColumnMap {
            strike_index,
            ..Default::default()
        };
        for (index, header) in headers.iter().enumerate() {
            let label = header.as_ref();
            if index < strike_index {
                map.call.assign(label, index);
            } else if index > strike_index {
                map.put.assign(label, index);
            }
        }

        // A single IV column is shared by both sides
        match (map.call.iv, map.put.iv) {
            (None, Some(iv)) => map.call.iv = Some(iv),
            (Some(iv), None) => map.put.iv = Some(iv),
            _ => {}
        }
        Some(map)
    }

    /// Map derived from fixed offsets around the strike column
    pub fn from_offsets(strike_index: usize) -> Self {
        ColumnMap {
            strike_index,
            call: SideColumns::from_offsets(strike_index, &CALL_OFFSETS),
            put: SideColumns::from_offsets(strike_index, &PUT_OFFSETS),
        }
    }

    /// Minimum number of cells a row needs for every mapped column
    pub fn required_len(&self) -> usize {
        [Some(self.strike_index), self.call.max_index(), self.put.max_index()]
            .into_iter()
            .flatten()
            .max()
            .map_or(0, |max| max + 1)
    }
}

/// How rows of the current table are read, chosen once per scrape pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnLayout {
    /// Header labels were found and mapped
    Headered(ColumnMap),
    /// No usable headers; fixed offsets around the strike column
    RelativeOffsets { strike_index: usize },
}

impl ColumnLayout {
    /// Pick the layout for a table: headers when present, offsets otherwise.
    /// `None` when the table has no rows to infer a strike column from.
    pub fn select(table: &ElementNode) -> Option<Self> {
        if let Some(map) = map_table(table) {
            return Some(ColumnLayout::Headered(map));
        }

        let rows = table_rows(table);
        let row = rows.iter().find(|row| !row_cells(row).is_empty())?;
        let cells = row_cells(row);

        let strike_index = cells
            .iter()
            .position(|cell| is_strike_cell(cell))
            .unwrap_or(cells.len() / 2);

        log::debug!("No header row, using offsets around strike column {}", strike_index);
        Some(ColumnLayout::RelativeOffsets { strike_index })
    }

    pub fn strike_index(&self) -> usize {
        match self {
            ColumnLayout::Headered(map) => map.strike_index,
            ColumnLayout::RelativeOffsets { strike_index } => *strike_index,
        }
    }

    /// Cells a row needs before it is read at all. Header maps need every
    /// mapped column; fixed offsets only need the strike cell and read any
    /// missing sub-column as zero.
    pub fn min_cells(&self) -> usize {
        match self {
            ColumnLayout::Headered(map) => map.required_len(),
            ColumnLayout::RelativeOffsets { strike_index } => strike_index + 1,
        }
    }

    /// Concrete cell indices for this layout
    pub fn columns(&self) -> ColumnMap {
        match self {
            ColumnLayout::Headered(map) => *map,
            ColumnLayout::RelativeOffsets { strike_index } => ColumnMap::from_offsets(*strike_index),
        }
    }
}

/// Column map of a table's header row; `None` without a header row or strike header
pub fn map_table(table: &ElementNode) -> Option<ColumnMap> {
    let header = header_row(table)?;
    let labels: Vec<String> = row_cells(header).into_iter().map(ElementNode::text).collect();
    ColumnMap::from_headers(&labels)
}

/// Column map for `table`, or for the first table of the page when `None`
pub fn map_columns(tree: &DomTree, table: Option<&ElementNode>) -> Option<ColumnMap> {
    let table = table.or_else(|| tree.find_table())?;
    map_table(table)
}

fn is_strike_cell(cell: &ElementNode) -> bool {
    cell.class_contains("strike")
        || cell
            .get_attribute("data-field")
            .is_some_and(|f| f.eq_ignore_ascii_case("strike"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Strike,
    Bid,
    Ask,
    Price,
    Volume,
    Iv,
    Delta,
    Gamma,
    Theta,
    Vega,
    Rho,
}

fn classify_label(raw: &str) -> Option<Label> {
    let label = raw.trim().to_lowercase();
    if label.starts_with("strike") {
        return Some(Label::Strike);
    }
    if label.contains("iv") || label.contains("volatility") {
        return Some(Label::Iv);
    }

    let word: String = label.chars().take_while(|c| c.is_alphabetic()).collect();
    match word.as_str() {
        "bid" => Some(Label::Bid),
        "ask" => Some(Label::Ask),
        "price" | "last" => Some(Label::Price),
        "volume" | "vol" => Some(Label::Volume),
        "delta" => Some(Label::Delta),
        "gamma" => Some(Label::Gamma),
        "theta" => Some(Label::Theta),
        "vega" => Some(Label::Vega),
        "rho" => Some(Label::Rho),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> Vec<&'static str> {
        vec![
            "Rho", "Vega", "Theta", "Gamma", "Delta", "Volume", "Price", "Ask", "Bid", "Strike", "IV, %", "Bid", "Ask",
            "Price", "Volume", "Delta", "Gamma", "Theta", "Vega", "Rho",
        ]
    }

    #[test]
    fn test_from_headers_splits_sides_at_strike() {
        let map = ColumnMap::from_headers(&headers()).unwrap();

        assert_eq!(map.strike_index, 9);
        assert_eq!(map.call.rho, Some(0));
        assert_eq!(map.call.delta, Some(4));
        assert_eq!(map.call.bid, Some(8));
        assert_eq!(map.call.iv, Some(10));
        assert_eq!(map.put.iv, Some(10));
        assert_eq!(map.put.bid, Some(11));
        assert_eq!(map.put.rho, Some(19));
        assert_eq!(map.required_len(), 20);
    }

    #[test]
    fn test_labels_are_case_insensitive() {
        let map = ColumnMap::from_headers(&["DELTA", "bid", "STRIKE", "Implied Volatility", "ask"]).unwrap();
        assert_eq!(map.call.delta, Some(0));
        assert_eq!(map.call.bid, Some(1));
        assert_eq!(map.put.iv, Some(3));
        assert_eq!(map.put.ask, Some(4));
    }

    #[test]
    fn test_no_strike_header() {
        assert!(ColumnMap::from_headers(&["Bid", "Ask"]).is_none());
    }

    #[test]
    fn test_offsets_follow_chain_layout() {
        let map = ColumnMap::from_offsets(13);
        assert_eq!(map.call.price, Some(9));
        assert_eq!(map.call.ask, Some(10));
        assert_eq!(map.call.bid, Some(11));
        assert_eq!(map.call.volume, Some(12));
        assert_eq!(map.call.delta, Some(8));
        assert_eq!(map.call.rho, Some(4));
        assert_eq!(map.call.iv, Some(14));
        assert_eq!(map.put.iv, Some(14));
        assert_eq!(map.put.volume, Some(15));
        assert_eq!(map.put.bid, Some(16));
        assert_eq!(map.put.ask, Some(17));
        assert_eq!(map.put.price, Some(18));
        assert_eq!(map.put.delta, Some(20));
        assert_eq!(map.put.rho, Some(24));
        assert_eq!(map.required_len(), 25);

        let narrow = ColumnMap::from_offsets(3);
        assert_eq!(narrow.call.bid, Some(1));
        assert_eq!(narrow.call.price, None);
        assert_eq!(narrow.call.rho, None);
    }

    #[test]
    fn test_single_iv_header_is_shared() {
        let map = ColumnMap::from_headers(&["Price", "Ask", "Bid", "Volume", "Strike", "IV, %", "Volume", "Bid"]).unwrap();
        assert_eq!(map.call.iv, Some(5));
        assert_eq!(map.put.iv, Some(5));
        assert_eq!(map.call.volume, Some(3));
        assert_eq!(map.put.volume, Some(6));
    }

    fn cell(tag: &str, text: &str) -> ElementNode {
        ElementNode::new(tag).with_text(text)
    }

    #[test]
    fn test_select_headered() {
        let header = ElementNode::new("tr").with_children(headers().into_iter().map(|h| cell("th", h)).collect());
        let table = ElementNode::new("table").with_children(vec![header]);

        match ColumnLayout::select(&table) {
            Some(ColumnLayout::Headered(map)) => assert_eq!(map.strike_index, 9),
            other => panic!("Expected headered layout, got {:?}", other),
        }
    }

    #[test]
    fn test_select_falls_back_to_strike_cell() {
        let mut cells: Vec<ElementNode> = (0..21).map(|i| cell("td", &i.to_string())).collect();
        cells[10] = cell("td", "6900").with_attribute("class", "cell-strike");
        let table = ElementNode::new("table").with_children(vec![ElementNode::new("tr").with_children(cells)]);

        let layout = ColumnLayout::select(&table).unwrap();
        assert_eq!(layout, ColumnLayout::RelativeOffsets { strike_index: 10 });
        assert_eq!(layout.columns().put.rho, Some(21));
        assert_eq!(layout.columns().call.rho, Some(1));
    }

    #[test]
    fn test_select_uses_middle_cell_without_markers() {
        let cells: Vec<ElementNode> = (0..7).map(|i| cell("td", &i.to_string())).collect();
        let table = ElementNode::new("table").with_children(vec![ElementNode::new("tr").with_children(cells)]);

        assert_eq!(ColumnLayout::select(&table).unwrap().strike_index(), 3);
    }

    #[test]
    fn test_select_empty_table() {
        assert!(ColumnLayout::select(&ElementNode::new("table")).is_none());
    }

    #[test]
    fn test_map_columns_discovers_table() {
        let header = ElementNode::new("tr").with_children(vec![cell("th", "Bid"), cell("th", "Strike"), cell("th", "Ask")]);
        let tree = DomTree::new(ElementNode::new("body").with_children(vec![
            ElementNode::new("table").with_children(vec![header]),
        ]));

        let map = map_columns(&tree, None).unwrap();
        assert_eq!(map.call.bid, Some(0));
        assert_eq!(map.put.ask, Some(2));
        assert!(map_columns(&DomTree::new(ElementNode::new("body")), None).is_none());
    }
}
