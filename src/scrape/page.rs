use crate::dom::{DomTree, ElementNode, header_row, row_texts, table_rows};
use crate::error::{BridgeError, Result};
use crate::model::{ScrapedOption, Side};
use crate::scrape::columns::ColumnLayout;
use crate::scrape::number::parse_number;
use crate::scrape::row::{RowQuotes, parse_row_with_layout};
use crate::scrape::url::ChainUrl;
use serde::{Deserialize, Serialize};

/// Everything read from one chain page in a single pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParsedPage {
    pub ticker: Option<String>,
    pub expiration: String,
    /// `YYYYMMDD` code of the shown expiration, when the URL carries one
    pub date_code: Option<String>,
    pub underlying_price: Option<f64>,
    pub options: Vec<ScrapedOption>,
}

/// Parse the chain table of a page.
///
/// Fails only when there is no table (or no rows to lay out); individual
/// rows without a readable strike are skipped.
pub fn parse_chain(tree: &DomTree) -> Result<ParsedPage> {
    let table = tree
        .find_table()
        .ok_or_else(|| BridgeError::TableNotFound(tree.meta.url.clone()))?;

    let options = parse_table(table)?;
    let url = ChainUrl::parse(&tree.meta.url);

    let expiration = tree
        .meta
        .expiration
        .clone()
        .filter(|e| !e.is_empty())
        .or_else(|| url.date_code.clone())
        .unwrap_or_default();

    Ok(ParsedPage {
        ticker: url.ticker,
        expiration,
        date_code: url.date_code,
        underlying_price: tree.meta.underlying.as_deref().and_then(parse_number),
        options,
    })
}

/// Parse every data row of a table into call and put records
pub fn parse_table(table: &ElementNode) -> Result<Vec<ScrapedOption>> {
    let layout = ColumnLayout::select(table)
        .ok_or_else(|| BridgeError::TableNotFound("table has no rows".to_string()))?;
    let header = header_row(table);

    let mut options = Vec::new();
    let mut skipped = 0usize;
    for row in table_rows(table) {
        if header.is_some_and(|h| std::ptr::eq(h, row)) {
            continue;
        }

        let cells = row_texts(row);
        let quotes = parse_row_with_layout(&cells, &layout);
        if quotes.strike <= 0.0 {
            skipped += 1;
            continue;
        }
        push_sides(&mut options, &quotes);
    }

    if skipped > 0 {
        log::debug!("Skipped {} rows without a readable strike", skipped);
    }
    Ok(options)
}

fn push_sides(options: &mut Vec<ScrapedOption>, quotes: &RowQuotes) {
    options.push(ScrapedOption {
        side: Side::Call,
        strike: quotes.strike,
        quote: quotes.call_quote,
        greeks: quotes.call_greeks,
    });
    options.push(ScrapedOption {
        side: Side::Put,
        strike: quotes.strike,
        quote: quotes.put_quote,
        greeks: quotes.put_greeks,
    });
}
