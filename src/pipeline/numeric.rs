//! Lenient numeric coercion for model output.
//!
//! Models frequently return amounts as formatted strings: thousands
//! separators, currency symbols, unit suffixes, accounting-style
//! parentheses for negatives. A string that contains exactly one numeric
//! token coerces; anything ambiguous is rejected and becomes a type
//! mismatch upstream.

use std::sync::LazyLock;

use regex::Regex;

static NUMBER_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?\d[\d,]*(?:\.\d+)?").unwrap_or_else(|e| panic!("invalid number regex: {e}"))
});

/// Parse a formatted amount. Returns `None` when the string holds no
/// number or more than one, since picking one would be a guess.
pub fn coerce_numeric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Accounting convention: (4,500.00) means -4500.00.
    let parenthesized = trimmed.starts_with('(') && trimmed.ends_with(')');

    let mut tokens = NUMBER_TOKEN.find_iter(trimmed);
    let first = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }

    // Whatever surrounds the number must look like currency or unit
    // decoration, not prose ("see note 4" is a reference, not an amount).
    let surroundings = format!(
        "{}{}",
        &trimmed[..first.start()],
        &trimmed[first.end()..]
    );
    if !is_decoration(&surroundings) {
        return None;
    }

    let cleaned = first.as_str().replace(',', "");
    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    Some(if parenthesized { -value } else { value })
}

/// True when text around a number is plausible amount decoration: at most
/// one short ASCII word (a currency code), plus symbols and non-ASCII
/// unit characters.
fn is_decoration(text: &str) -> bool {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    words.len() <= 1 && words.iter().all(|w| w.len() <= 3)
}
