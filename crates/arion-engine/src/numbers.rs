//! Phone number normalisation and line matching rules

/// Normalise a caller/contact number for comparison and reporting.
///
/// Non-digit characters (`+`, spaces, dashes) are stripped; a bare
/// 10-digit number gets a leading `0`. Applying the function twice yields
/// the same value.
pub fn normalize(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 && !digits.starts_with('0') {
        format!("0{digits}")
    } else {
        digits
    }
}

/// Last four digits of a number, used to match inbound DIDs to configured
/// outbound lines.
pub fn last4(number: &str) -> &str {
    let digits_len = number.len();
    if digits_len <= 4 {
        number
    } else {
        &number[digits_len - 4..]
    }
}

/// Whether an inbound DID lands on the given configured line.
pub fn matches_line(did: &str, line_number: &str) -> bool {
    let did = normalize(did);
    let line = normalize(line_number);
    !did.is_empty() && !line.is_empty() && last4(&did) == last4(&line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_formatting() {
        assert_eq!(normalize("+98 912 345-6789"), "09123456789");
    }

    #[test]
    fn prefixes_bare_ten_digit_numbers() {
        assert_eq!(normalize("9123456789"), "09123456789");
    }

    #[test]
    fn is_idempotent() {
        for raw in ["9123456789", "+98 21 9130 2954", "02191302954", "911"] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "{raw}");
        }
    }

    #[test]
    fn line_matching_uses_last_four() {
        assert!(matches_line("02191302954", "2954"));
        assert!(matches_line("+98 21 9130 2954", "02191302954"));
        assert!(!matches_line("02191302954", "02191302955"));
        assert!(!matches_line("", "02191302954"));
    }
}
