// =============================================================================
// Instrument metadata — pip sizes, cash values, and quote-feed symbol codec
// =============================================================================
//
// Everything here is a pure function of the symbol string. Pip conventions:
//   - JPY-quoted pairs quote to 2 decimals -> pip = 0.01
//   - Gold (XAUUSD) is quoted in whole dollars -> pip = 1.00
//   - Silver (XAGUSD) -> pip = 0.01
//   - Everything else quotes to 4 decimals -> pip = 0.0001
// =============================================================================

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Price increment per pip for a pair.
pub fn tick_size(pair: &str) -> f64 {
    if pair.ends_with("JPY") {
        0.01
    } else if pair.starts_with("XAU") {
        1.0
    } else if pair.starts_with("XAG") {
        0.01
    } else {
        0.0001
    }
}

/// Cash value of one pip per standard lot, in account currency (USD).
///
/// JPY-quoted pairs are worth roughly $9/pip/lot at typical USDJPY rates;
/// everything else, metals included, is modeled at $10/pip/lot.
pub fn pip_cash_per_lot(pair: &str) -> Decimal {
    if pair.ends_with("JPY") {
        dec!(9.0)
    } else {
        dec!(10.0)
    }
}

/// Convert a price difference into pips for a pair.
pub fn price_diff_to_pips(pair: &str, diff: f64) -> f64 {
    diff / tick_size(pair)
}

/// Convert pips into a price difference for a pair.
pub fn pips_to_price_diff(pair: &str, pips: f64) -> f64 {
    pips * tick_size(pair)
}

// ---------------------------------------------------------------------------
// Quote-feed symbol codec
// ---------------------------------------------------------------------------

/// Convert an engine symbol to the quote-feed form: `EURUSD` -> `C.EUR/USD`.
pub fn to_feed_symbol(pair: &str) -> String {
    if pair.len() < 6 {
        return format!("C.{pair}");
    }
    format!("C.{}/{}", &pair[..3], &pair[3..])
}

/// Convert a quote-feed symbol back: `C.EUR/USD` -> `EURUSD`.
///
/// Returns `None` for frames that are not currency quotes.
pub fn from_feed_symbol(symbol: &str) -> Option<String> {
    let rest = symbol.strip_prefix("C.")?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.replace('/', ""))
}
