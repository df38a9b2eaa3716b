//! Consolidated symbol normalization grammar.
//!
//! Every component that needs to compare symbols across venues goes
//! through `base_symbol()` instead of rolling its own suffix-stripping —
//! this is the single place the grammar lives, per the design note that
//! motivated pulling it out of individual adapters.

const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "USD", "BUSD", "FDUSD", "TUSD"];
const PERP_SUFFIXES: &[&str] = &["-PERP", "PERP", "-SWAP", "SWAP"];
const SEPARATORS: &[char] = &['-', '_', '/', ':'];

/// Normalize a venue-native symbol (e.g. `"BTC-USDT-PERP"`, `"ethusdt"`,
/// `"WBTC/USD"`) down to its base asset (`"BTC"`, `"ETH"`, `"WBTC"`).
///
/// Order matters: strip the perp suffix first (it may itself contain a
/// separator, as in `-PERP`), then separators, then the quote suffix —
/// reversing the order would leave a dangling separator in symbols like
/// `BTC-PERP` once `-PERP` is removed after separators are gone.
pub fn base_symbol(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    let no_perp = strip_any_suffix(&upper, PERP_SUFFIXES);
    let no_sep: String = no_perp.chars().filter(|c| !SEPARATORS.contains(c)).collect();
    strip_any_suffix(&no_sep, QUOTE_SUFFIXES)
}

fn strip_any_suffix(s: &str, suffixes: &[&str]) -> String {
    for suffix in suffixes {
        if let Some(stripped) = s.strip_suffix(suffix) {
            if !stripped.is_empty() {
                return stripped.to_string();
            }
        }
    }
    s.to_string()
}
