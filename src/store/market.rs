//! Scraped market data shared with the destination page: the last
//! bulk-collected chain and the latest underlying price per ticker.

use crate::error::Result;
use crate::model::{FULL_CHAIN_KEY, FullChainSnapshot, UNDERLYING_KEY, UnderlyingQuote, store_ticker};
use crate::store::durable::{DurableStore, get_json, set_json};
use chrono::Utc;
use indexmap::IndexMap;

/// Ticker → latest quote, as kept under `tvc_underlying`
pub type UnderlyingMap = IndexMap<String, UnderlyingQuote>;

/// Replace the stored chain as a whole; nothing from the previous snapshot survives
pub async fn save_full_chain(store: &dyn DurableStore, snapshot: &FullChainSnapshot) -> Result<()> {
    log::info!(
        "Saving full chain for {}: {} expirations, {} options",
        snapshot.ticker.as_deref().unwrap_or("?"),
        snapshot.expirations.len(),
        snapshot.option_count()
    );
    set_json(store, FULL_CHAIN_KEY, snapshot).await
}

pub async fn load_full_chain(store: &dyn DurableStore) -> Result<Option<FullChainSnapshot>> {
    get_json(store, FULL_CHAIN_KEY).await
}

/// Record an underlying price; the last write wins and no history is kept
pub async fn set_underlying(store: &dyn DurableStore, ticker: &str, price: f64) -> Result<UnderlyingQuote> {
    let ticker = store_ticker(ticker).to_string();
    let mut quotes = load_underlying(store).await?;

    let quote = UnderlyingQuote {
        ticker: ticker.clone(),
        price,
        observed_at: Utc::now(),
    };
    quotes.insert(ticker, quote.clone());
    set_json(store, UNDERLYING_KEY, &quotes).await?;
    Ok(quote)
}

pub async fn load_underlying(store: &dyn DurableStore) -> Result<UnderlyingMap> {
    Ok(get_json(store, UNDERLYING_KEY).await?.unwrap_or_default())
}

/// Latest price for a ticker, if any was recorded
pub async fn underlying_price(store: &dyn DurableStore, ticker: &str) -> Result<Option<f64>> {
    let quotes = load_underlying(store).await?;
    Ok(quotes.get(store_ticker(ticker)).map(|q| q.price))
}
