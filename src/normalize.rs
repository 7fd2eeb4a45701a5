//! Column header normalization.
//!
//! Applied identically to every chunk of a file so destination column identity never drifts
//! between chunks.

/// Separator that replaces spaces, hyphens and periods
pub const SEPARATOR: char = '_';

/// Normalize one raw header cell: trim, map ` `, `-`, `.` to `_` one-for-one, lowercase.
pub fn normalize_column(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => SEPARATOR,
            other => other,
        })
        .collect::<String>()
        .to_lowercase()
}

/// Normalize a whole header, preserving count and order
pub fn normalize_header<S: AsRef<str>>(raw: &[S]) -> Vec<String> {
    raw.iter().map(|c| normalize_column(c.as_ref())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_column() {
        let cases = [
            ("order_id", "order_id"),
            ("  Order ID ", "order_id"),
            ("product-name.length", "product_name_length"),
            ("Review  Score", "review__score"),
            ("GEOLOCATION_LAT", "geolocation_lat"),
            ("", ""),
            ("Preço", "preço"),
        ];

        for (input, expected) in cases {
            assert_eq!(normalize_column(input), expected, "input '{}'", input);
        }
    }

    #[test]
    fn test_normalize_header_preserves_count_and_order() {
        let raw = ["Seller ID", "seller_zip_code_prefix", "Seller-City"];
        let normalized = normalize_header(&raw);
        assert_eq!(
            normalized,
            vec!["seller_id", "seller_zip_code_prefix", "seller_city"]
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let raw = [
            " Customer Unique-ID ",
            "a.b.c",
            "MiXeD Case",
            "\tTabbed\t",
            "already_normal",
        ];
        let once = normalize_header(&raw);
        let twice = normalize_header(&once);
        assert_eq!(once, twice);
    }
}
