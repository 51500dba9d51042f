//! Row parsing. A malformed row degrades to zeros, it never fails the scrape.

use crate::model::{Greeks, Quote};
use crate::scrape::columns::{ColumnLayout, ColumnMap, SideColumns};
use crate::scrape::number::{cell_count, cell_value};

/// Both sides of one strike
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RowQuotes {
    pub strike: f64,
    pub call_quote: Quote,
    pub call_greeks: Greeks,
    pub put_quote: Quote,
    pub put_greeks: Greeks,
}

/// Parse one row with an explicit strike column and an optional header map.
///
/// Without a map the fixed offsets around `strike_index` are used. A row with
/// fewer cells than the map expects yields zero quotes and greeks.
pub fn parse_row<S: AsRef<str>>(cells: &[S], strike_index: usize, map: Option<&ColumnMap>) -> RowQuotes {
    let layout = match map {
        Some(map) => ColumnLayout::Headered(*map),
        None => ColumnLayout::RelativeOffsets { strike_index },
    };
    parse_row_with_layout(cells, &layout)
}

/// Parse one row with the layout chosen for the current table
pub fn parse_row_with_layout<S: AsRef<str>>(cells: &[S], layout: &ColumnLayout) -> RowQuotes {
    read_row(cells, &layout.columns(), layout.min_cells())
}

fn read_row<S: AsRef<str>>(cells: &[S], columns: &ColumnMap, min_cells: usize) -> RowQuotes {
    let strike = cell_at(cells, Some(columns.strike_index)).map_or(0.0, cell_value);

    if cells.len() < min_cells {
        log::trace!("Row has {} cells, layout needs {}; reading as empty", cells.len(), min_cells);
        return RowQuotes {
            strike,
            ..Default::default()
        };
    }

    let (call_quote, call_greeks) = read_side(cells, &columns.call);
    let (put_quote, put_greeks) = read_side(cells, &columns.put);

    RowQuotes {
        strike,
        call_quote,
        call_greeks,
        put_quote,
        put_greeks,
    }
}

fn read_side<S: AsRef<str>>(cells: &[S], side: &SideColumns) -> (Quote, Greeks) {
    let value = |index: Option<usize>| cell_at(cells, index).map_or(0.0, cell_value);

    let quote = Quote {
        bid: value(side.bid),
        ask: value(side.ask),
        price: value(side.price),
        volume: cell_at(cells, side.volume).map_or(0, cell_count),
        iv: value(side.iv),
    };
    let greeks = Greeks {
        delta: value(side.delta),
        gamma: value(side.gamma),
        theta: value(side.theta),
        vega: value(side.vega),
        rho: value(side.rho),
    };
    (quote, greeks)
}

fn cell_at<S: AsRef<str>>(cells: &[S], index: Option<usize>) -> Option<&str> {
    index.and_then(|i| cells.get(i)).map(AsRef::as_ref)
}
