use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A parsed APRS-IS server-side filter expression, e.g.
/// `r/51.5/-0.1/50 -t/n b/M0TEST*`.
///
/// The gateway never evaluates filters itself; the expression is validated at
/// startup so a typo surfaces as a warning instead of an unexpectedly empty
/// (or unexpectedly full) feed, then passed verbatim on the login line.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpr {
    pub terms: Vec<FilterTerm>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    pub negated: bool,
    pub kind: FilterKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// r/<lat>/<lon>/<range_km>
    Range { lat: f64, lon: f64, km: f64 },
    /// a/<lat1>/<lon1>/<lat2>/<lon2>
    Area {
        lat1: f64,
        lon1: f64,
        lat2: f64,
        lon2: f64,
    },
    /// b/<call1>/<call2>/... (wildcards allowed)
    Buddies(Vec<String>),
    /// p/<prefix1>/<prefix2>/...
    Prefixes(Vec<String>),
    /// t/<letters> (packet type flags)
    TypeSet(String),
    /// Token the gateway does not recognize; preserved verbatim
    Unknown(String),
}

#[derive(Debug)]
pub struct ParseFilterError {
    pub message: String,
}

impl Display for ParseFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for ParseFilterError {}

impl FilterExpr {
    /// Tokens that did not match any known filter form. Surfaced as startup
    /// warnings; the server may still accept them.
    pub fn unknown_terms(&self) -> Vec<&str> {
        self.terms
            .iter()
            .filter_map(|term| match &term.kind {
                FilterKind::Unknown(raw) => Some(raw.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl FromStr for FilterExpr {
    type Err = ParseFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms = Vec::new();
        for raw in s.split_whitespace() {
            let (negated, token) = match raw.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            terms.push(FilterTerm {
                negated,
                kind: parse_term(token),
            });
        }
        if terms.is_empty() {
            return Err(ParseFilterError {
                message: "empty filter expression".to_string(),
            });
        }
        Ok(FilterExpr { terms })
    }
}

fn parse_term(token: &str) -> FilterKind {
    let mut parts = token.split('/');
    let tag = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match tag {
        "r" if args.len() == 3 => {
            match (
                args[0].parse::<f64>(),
                args[1].parse::<f64>(),
                args[2].parse::<f64>(),
            ) {
                (Ok(lat), Ok(lon), Ok(km)) => FilterKind::Range { lat, lon, km },
                _ => FilterKind::Unknown(token.to_string()),
            }
        }
        "a" if args.len() == 4 => {
            let coords: Vec<f64> = args.iter().filter_map(|a| a.parse().ok()).collect();
            match coords.as_slice() {
                [lat1, lon1, lat2, lon2] => FilterKind::Area {
                    lat1: *lat1,
                    lon1: *lon1,
                    lat2: *lat2,
                    lon2: *lon2,
                },
                _ => FilterKind::Unknown(token.to_string()),
            }
        }
        "b" if !args.is_empty() && args.iter().all(|a| !a.is_empty()) => {
            FilterKind::Buddies(args.iter().map(|a| a.to_string()).collect())
        }
        "p" if !args.is_empty() && args.iter().all(|a| !a.is_empty()) => {
            FilterKind::Prefixes(args.iter().map(|a| a.to_string()).collect())
        }
        "t" if args.len() == 1 && !args[0].is_empty() => FilterKind::TypeSet(args[0].to_string()),
        _ => FilterKind::Unknown(token.to_string()),
    }
}

impl Display for FilterExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for term in &self.terms {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if term.negated {
                write!(f, "-")?;
            }
            write!(f, "{}", term.kind)?;
        }
        Ok(())
    }
}

impl Display for FilterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterKind::Range { lat, lon, km } => write!(f, "r/{lat}/{lon}/{km}"),
            FilterKind::Area {
                lat1,
                lon1,
                lat2,
                lon2,
            } => write!(f, "a/{lat1}/{lon1}/{lat2}/{lon2}"),
            FilterKind::Buddies(calls) => write!(f, "b/{}", calls.join("/")),
            FilterKind::Prefixes(prefixes) => write!(f, "p/{}", prefixes.join("/")),
            FilterKind::TypeSet(letters) => write!(f, "t/{letters}"),
            FilterKind::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_filter() {
        let expr: FilterExpr = "r/51.5/-0.1/50".parse().unwrap();
        assert_eq!(expr.terms.len(), 1);
        assert!(matches!(
            expr.terms[0].kind,
            FilterKind::Range { lat, lon, km } if lat == 51.5 && lon == -0.1 && km == 50.0
        ));
        assert!(expr.unknown_terms().is_empty());
    }

    #[test]
    fn test_parse_compound_with_negation() {
        let expr: FilterExpr = "b/M0TEST*/2E0* -t/n p/G/M".parse().unwrap();
        assert_eq!(expr.terms.len(), 3);
        assert!(!expr.terms[0].negated);
        assert!(expr.terms[1].negated);
        assert!(matches!(expr.terms[1].kind, FilterKind::TypeSet(ref t) if t == "n"));
        assert!(matches!(expr.terms[2].kind, FilterKind::Prefixes(_)));
    }

    #[test]
    fn test_malformed_range_is_unknown() {
        let expr: FilterExpr = "r/51.5/oops/50 m/200".parse().unwrap();
        assert_eq!(expr.unknown_terms(), vec!["r/51.5/oops/50", "m/200"]);
    }

    #[test]
    fn test_empty_expression_rejected() {
        assert!("   ".parse::<FilterExpr>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let source = "r/51.5/-0.1/50 -t/n b/M0TEST*";
        let expr: FilterExpr = source.parse().unwrap();
        assert_eq!(expr.to_string(), source);
    }
}
