use crate::error::WrtError;

/// Parses a kernel byte counter such as
/// `/sys/class/net/eth0/statistics/rx_bytes`.
///
/// The value is the first non-empty line. Anything else there means the
/// read failed (missing interface, shell error) and is a parse error rather
/// than a zero.
pub fn parse_counter(raw: &str) -> Result<u64, WrtError> {
    let value = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| WrtError::ParseError("counter output is empty".to_string()))?;
    value
        .parse()
        .map_err(|_| WrtError::ParseError(format!("not a byte counter: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_value() {
        assert_eq!(parse_counter("1849283741\n").unwrap(), 1_849_283_741);
        assert_eq!(parse_counter("\n  42 \n").unwrap(), 42);
    }

    #[test]
    fn shell_errors_are_parse_errors() {
        let err = parse_counter("cat: can't open '/sys/class/net/eth0/statistics/rx_bytes'\n")
            .unwrap_err();
        assert!(matches!(err, WrtError::ParseError(_)));
        assert!(matches!(parse_counter(""), Err(WrtError::ParseError(_))));
        assert!(matches!(parse_counter("-5"), Err(WrtError::ParseError(_))));
    }
}
