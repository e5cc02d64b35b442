//! HTTP status code ranges that trigger ban accounting.

use std::fmt;
use std::str::FromStr;

use http::StatusCode;

use crate::error::{Fail2BanError, Fail2BanResult};

/// An inclusive range of HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpCodeRange {
    /// Lowest code in the range.
    pub low: u16,
    /// Highest code in the range.
    pub high: u16,
}

impl HttpCodeRange {
    /// Create a range, rejecting inverted or out-of-range bounds.
    ///
    /// # Errors
    ///
    /// Returns `Fail2BanError::InvalidCodeRange` if a bound is not a valid
    /// status code or `low > high`.
    pub fn new(low: u16, high: u16) -> Fail2BanResult<Self> {
        let invalid = |reason: &str| Fail2BanError::InvalidCodeRange {
            input: format!("{low}-{high}"),
            reason: reason.to_string(),
        };
        if StatusCode::from_u16(low).is_err() || StatusCode::from_u16(high).is_err() {
            return Err(invalid("status codes must be within 100-999"));
        }
        if low > high {
            return Err(invalid("low bound above high bound"));
        }
        Ok(Self { low, high })
    }

    /// Parse `"low-high"` or a single code.
    ///
    /// # Errors
    ///
    /// Returns `Fail2BanError::InvalidCodeRange` on malformed input.
    pub fn parse(text: &str) -> Fail2BanResult<Self> {
        let text = text.trim();
        let code = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|e| Fail2BanError::InvalidCodeRange {
                    input: text.to_string(),
                    reason: e.to_string(),
                })
        };

        let (low, high) = match text.split_once('-') {
            Some((low, high)) => (code(low)?, code(high)?),
            None => {
                let single = code(text)?;
                (single, single)
            }
        };

        Self::new(low, high).map_err(|e| match e {
            Fail2BanError::InvalidCodeRange { reason, .. } => Fail2BanError::InvalidCodeRange {
                input: text.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Whether `code` falls inside the range.
    #[must_use]
    pub const fn contains(&self, code: u16) -> bool {
        self.low <= code && code <= self.high
    }
}

impl FromStr for HttpCodeRange {
    type Err = Fail2BanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HttpCodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.low == self.high {
            write!(f, "{}", self.low)
        } else {
            write!(f, "{}-{}", self.low, self.high)
        }
    }
}

/// A disjunction of status code ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpCodeRanges(Vec<HttpCodeRange>);

impl HttpCodeRanges {
    /// Parse a list of ranges. Each item may itself be a comma separated list.
    ///
    /// # Errors
    ///
    /// Returns the first range that fails to parse.
    pub fn parse<I, S>(list: I) -> Fail2BanResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ranges = Vec::new();
        for item in list {
            for part in item.as_ref().split(',').filter(|p| !p.trim().is_empty()) {
                ranges.push(HttpCodeRange::parse(part)?);
            }
        }
        Ok(Self(ranges))
    }

    /// Whether any range contains `status`.
    #[must_use]
    pub fn contains(&self, status: StatusCode) -> bool {
        let code = status.as_u16();
        self.0.iter().any(|range| range.contains(code))
    }

    /// The configured ranges.
    #[must_use]
    pub fn ranges(&self) -> &[HttpCodeRange] {
        &self.0
    }

    /// Whether no range is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<HttpCodeRange>> for HttpCodeRanges {
    fn from(ranges: Vec<HttpCodeRange>) -> Self {
        Self(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("400-499", 400, 499 ; "range")]
    #[test_case("404", 404, 404 ; "single")]
    #[test_case(" 500 - 599 ", 500, 599 ; "whitespace")]
    #[test_case("200-200", 200, 200 ; "degenerate")]
    fn test_parse_range(input: &str, low: u16, high: u16) {
        let range = HttpCodeRange::parse(input).unwrap();
        assert_eq!(range, HttpCodeRange { low, high });
    }

    #[test_case("499-400" ; "inverted")]
    #[test_case("abc" ; "not a number")]
    #[test_case("1000" ; "too large")]
    #[test_case("99" ; "too small")]
    #[test_case("400-" ; "missing high")]
    #[test_case("400-450-499" ; "too many parts")]
    #[test_case("" ; "empty")]
    fn test_parse_range_rejects(input: &str) {
        assert!(matches!(
            HttpCodeRange::parse(input),
            Err(Fail2BanError::InvalidCodeRange { .. })
        ));
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let range = HttpCodeRange::parse("400-499").unwrap();
        assert!(range.contains(400));
        assert!(range.contains(499));
        assert!(!range.contains(399));
        assert!(!range.contains(500));
    }

    #[test]
    fn test_ranges_disjunction() {
        let ranges = HttpCodeRanges::parse(["401", "403-404", "500-599"]).unwrap();
        assert!(ranges.contains(StatusCode::UNAUTHORIZED));
        assert!(ranges.contains(StatusCode::NOT_FOUND));
        assert!(ranges.contains(StatusCode::BAD_GATEWAY));
        assert!(!ranges.contains(StatusCode::BAD_REQUEST));
        assert!(!ranges.contains(StatusCode::OK));
    }

    #[test]
    fn test_ranges_comma_separated() {
        let ranges = HttpCodeRanges::parse(["400,401,403-499"]).unwrap();
        assert_eq!(ranges.ranges().len(), 3);
        assert!(ranges.contains(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_empty_ranges_match_nothing() {
        let ranges = HttpCodeRanges::default();
        assert!(ranges.is_empty());
        assert!(!ranges.contains(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_display() {
        assert_eq!(HttpCodeRange::parse("404").unwrap().to_string(), "404");
        assert_eq!(HttpCodeRange::parse("400-499").unwrap().to_string(), "400-499");
    }
}
