//! Chain page addressing.
//!
//! Chain pages look like
//! `https://www.tradingview.com/options/chain/CME_MINI-ESH2026/?series=CME_MINI%3AESH2026%3BES%3B20260115`
//! where the decoded series is `<symbol>;<root>;<YYYYMMDD>`.

/// A parsed chain page URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUrl {
    /// URL without query string
    pub base: String,
    /// Instrument ticker from the path, e.g. `ESH2026`
    pub ticker: Option<String>,
    /// Decoded series without the date part, e.g. `CME_MINI:ESH2026;ES`
    pub series_prefix: Option<String>,
    /// Date code of the selected expiration, e.g. `20260115`
    pub date_code: Option<String>,
}

impl ChainUrl {
    pub fn parse(url: &str) -> Self {
        let (base, query) = match url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (url, None),
        };

        let ticker = base
            .split("/options/chain/")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .and_then(|segment| segment.rsplit('-').next())
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let series = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "series")
                .and_then(|(_, value)| urlencoding::decode(value).ok())
                .map(|decoded| decoded.into_owned())
        });

        let (series_prefix, date_code) = match series {
            Some(series) => {
                let parts: Vec<&str> = series.split(';').collect();
                if parts.len() >= 3 {
                    (Some(parts[..2].join(";")), Some(parts[2].to_string()))
                } else {
                    (None, None)
                }
            }
            None => (None, None),
        };

        Self {
            base: base.to_string(),
            ticker,
            series_prefix,
            date_code,
        }
    }

    /// URL selecting another expiration of the same series
    pub fn for_expiration(&self, date_code: &str) -> Option<String> {
        let prefix = self.series_prefix.as_ref()?;
        let series = format!("{};{}", prefix, date_code);
        Some(format!("{}?series={}", self.base, urlencoding::encode(&series)))
    }
}

/// Chain page URL for an instrument, e.g. `…/options/chain/CME_MINI-ESH2026/`
pub fn chain_url(prefix: &str, exchange: &str, ticker: &str) -> String {
    format!("{}/{}-{}/", prefix.trim_end_matches('/'), exchange, ticker)
}
