//! Numeric cell parsing

/// Parse a displayed number.
///
/// Tolerates thousands separators, unicode minus signs, non-breaking and thin
/// spaces, a trailing `%` (returned as a fraction) and `K`/`M`/`B` suffixes.
/// Placeholders such as `—`, `–`, `-` or `N/A` mean "no value".
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut text: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '\u{00a0}' | '\u{2009}' | '\u{202f}' | '\'' | '$' | '+') && !c.is_whitespace())
        .map(|c| match c {
            '\u{2212}' | '\u{2012}' | '\u{fe63}' | '\u{ff0d}' => '-',
            other => other,
        })
        .collect();

    if text.is_empty() || text.chars().all(|c| matches!(c, '-' | '\u{2013}' | '\u{2014}' | '.')) {
        return None;
    }
    if text.eq_ignore_ascii_case("n/a") || text.eq_ignore_ascii_case("nan") {
        return None;
    }

    let mut scale = 1.0;
    let mut percent = false;
    if text.ends_with('%') {
        text.pop();
        percent = true;
    } else if let Some(last) = text.chars().last() {
        let multiplier = match last.to_ascii_uppercase() {
            'K' => Some(1e3),
            'M' => Some(1e6),
            'B' => Some(1e9),
            _ => None,
        };
        if let Some(multiplier) = multiplier {
            text.pop();
            scale = multiplier;
        }
    }

    let value: f64 = text.parse().ok()?;
    let value = if percent { value / 100.0 } else { value * scale };
    value.is_finite().then_some(value)
}

/// Parse a cell, degrading to zero
pub fn cell_value(raw: &str) -> f64 {
    parse_number(raw).unwrap_or(0.0)
}

/// Parse a count cell, degrading to zero
pub fn cell_count(raw: &str) -> u64 {
    let value = cell_value(raw);
    if value > 0.0 { value.round() as u64 } else { 0 }
}
