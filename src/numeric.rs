// Numeric cell coercion
//
// Budget spreadsheets carry amounts in a handful of loose formats:
// "$1,234.5", "(500)" for negatives, "N/A"/"--"/blank for missing,
// "12.5%" for rates. One function maps all of them to Option<f64> and
// never errors; a malformed cell is simply None.

/// Sentinel strings that mean "no value". Compared case-insensitively
/// after trimming.
const NULL_SENTINELS: &[&str] = &["", "n/a", "na", "-", "--", "tbd", "*", "."];

/// Coerce a raw cell value to a number.
///
/// Recognized forms:
/// - thousands separators: "1,234,567" -> 1234567.0
/// - currency prefix: "$450.2" -> 450.2
/// - parenthesized negatives: "(500)" -> -500.0
/// - explicit sign: "-12.5", "+3"
/// - percent suffix: "12.5%" -> 12.5 (the sign, not the ratio)
/// - null sentinels (blank, N/A, --, ...) -> None
///
/// Anything else that fails to parse is None, never an error.
pub fn coerce_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if NULL_SENTINELS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }

    let mut s = trimmed.to_string();

    // Parenthesized negative: "(1,500)" -> -1500
    let negative = s.starts_with('(') && s.ends_with(')');
    if negative {
        s = s[1..s.len() - 1].to_string();
    }

    // Strip currency symbols, separators, percent signs
    s = s
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '%' | ' '))
        .collect();

    if s.is_empty() {
        return None;
    }

    let value: f64 = s.parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    Some(if negative { -value } else { value })
}

/// Coerce a cell expected to hold a quantity (unit count). Quantities
/// share the amount grammar but are rounded to whole units.
pub fn coerce_quantity(raw: &str) -> Option<f64> {
    coerce_amount(raw).map(|v| v.round())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(coerce_amount("1234"), Some(1234.0));
        assert_eq!(coerce_amount("12.5"), Some(12.5));
        assert_eq!(coerce_amount("-12.5"), Some(-12.5));
        assert_eq!(coerce_amount("+3"), Some(3.0));
    }

    #[test]
    fn test_thousands_and_currency() {
        assert_eq!(coerce_amount("1,234,567"), Some(1234567.0));
        assert_eq!(coerce_amount("$450.2"), Some(450.2));
        assert_eq!(coerce_amount("$ 1,000"), Some(1000.0));
    }

    #[test]
    fn test_parenthesized_negative() {
        assert_eq!(coerce_amount("(500)"), Some(-500.0));
        assert_eq!(coerce_amount("($1,500.25)"), Some(-1500.25));
    }

    #[test]
    fn test_percent() {
        assert_eq!(coerce_amount("12.5%"), Some(12.5));
    }

    #[test]
    fn test_null_sentinels() {
        for raw in ["", "  ", "N/A", "n/a", "NA", "-", "--", "TBD", "*", "."] {
            assert_eq!(coerce_amount(raw), None, "sentinel {:?}", raw);
        }
    }

    #[test]
    fn test_garbage_is_none_not_error() {
        assert_eq!(coerce_amount("classified"), None);
        assert_eq!(coerce_amount("1.2.3"), None);
        assert_eq!(coerce_amount("(abc)"), None);
    }

    #[test]
    fn test_quantity_rounds() {
        assert_eq!(coerce_quantity("12.6"), Some(13.0));
        assert_eq!(coerce_quantity("(2)"), Some(-2.0));
        assert_eq!(coerce_quantity("N/A"), None);
    }
}
