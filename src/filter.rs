use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use tracing::debug;

use crate::error::{Error, Result};

/// A parsed expression for identifying serial devices of interest.
///
/// An expression is a whitespace-separated list of terms. Each term is
/// either `attribute:pattern`, which must match that attribute of a
/// device, or a bare `pattern`, which may match any attribute value.
/// Patterns are case-insensitive globs (`*` and `?`), and may be
/// double-quoted to contain whitespace. All terms must match for a
/// device to match; the empty expression matches every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortFilter {
    input: String,
    terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Term {
    /// Attribute key the pattern applies to; `None` means any attribute.
    field: Option<String>,
    /// Lowercased glob pattern.
    pattern: String,
}

impl Term {
    fn hits(&self, key: &str, value: &str) -> bool {
        let relevant = match &self.field {
            Some(field) => key.eq_ignore_ascii_case(field),
            None => true,
        };
        relevant && glob_match(&self.pattern, &value.to_lowercase())
    }
}

impl PortFilter {
    /// Parses a port filter expression.
    pub fn parse(input: &str) -> Result<Self> {
        let cs: Vec<char> = input.chars().collect();
        let mut terms = Vec::new();
        let mut i = 0;

        while i < cs.len() {
            if cs[i].is_whitespace() {
                i += 1;
                continue;
            }

            let mut field = None;
            if cs[i].is_alphanumeric() || cs[i] == '_' {
                let mut j = i;
                while j < cs.len() && (cs[j].is_alphanumeric() || cs[j] == '_') {
                    j += 1;
                }
                if j < cs.len() && cs[j] == ':' {
                    field = Some(cs[i..j].iter().collect::<String>().to_lowercase());
                    i = j + 1;
                }
            }

            let mut pattern = String::new();
            if i < cs.len() && cs[i] == '"' {
                i += 1;
                let mut closed = false;
                while i < cs.len() {
                    match cs[i] {
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        '\\' if i + 1 < cs.len() => {
                            pattern.push(cs[i + 1]);
                            i += 2;
                        }
                        c => {
                            pattern.push(c);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(Error::FilterInvalid(format!(
                        "unterminated quote in {input:?}"
                    )));
                }
            } else {
                while i < cs.len() && !cs[i].is_whitespace() {
                    pattern.push(cs[i]);
                    i += 1;
                }
            }

            terms.push(Term {
                field,
                pattern: pattern.to_lowercase(),
            });
        }

        debug!(%input, terms = terms.len(), "parsed port filter");
        Ok(Self {
            input: input.to_string(),
            terms,
        })
    }

    /// Tests this filter against a device's attributes.
    pub fn matches(&self, attrs: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|term| attrs.iter().any(|(k, v)| term.hits(k, v)))
    }

    /// The attribute keys matched by this expression, typically for
    /// display highlighting purposes.
    pub fn matched_keys(&self, attrs: &BTreeMap<String, String>) -> BTreeSet<String> {
        attrs
            .iter()
            .filter(|(k, v)| self.terms.iter().any(|term| term.hits(k, v)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Whether the expression has no terms (and so matches every device).
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl Display for PortFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.input)
    }
}

/// Anchored glob match; `pattern` and `text` must already share case.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_p, star_t)) = star {
            pi = star_p + 1;
            ti = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = PortFilter::parse("").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&attrs(&[])));
        assert!(filter.matches(&attrs(&[("product", "anything")])));
    }

    #[test]
    fn bare_term_matches_any_attribute() {
        let filter = PortFilter::parse("tigard").unwrap();
        assert!(!filter.matches(&attrs(&[("product", "Tigard V1.1"), ("vid", "0403")])));
        assert!(filter.matches(&attrs(&[("product", "tigard")])));
    }

    #[test]
    fn bare_term_globs() {
        let filter = PortFilter::parse("*tigard*").unwrap();
        assert!(filter.matches(&attrs(&[("product", "Tigard V1.1")])));
        assert!(!filter.matches(&attrs(&[("product", "other board")])));
    }

    #[test]
    fn fielded_term_matches_only_that_attribute() {
        let filter = PortFilter::parse("vid_pid:0403:*").unwrap();
        assert!(filter.matches(&attrs(&[("vid_pid", "0403:6010")])));
        assert!(!filter.matches(&attrs(&[("serial_number", "0403:6010")])));
    }

    #[test]
    fn all_terms_must_match() {
        let filter = PortFilter::parse("vid:0403 product:*uart*").unwrap();
        assert!(filter.matches(&attrs(&[("vid", "0403"), ("product", "Dual UART")])));
        assert!(!filter.matches(&attrs(&[("vid", "0403"), ("product", "JTAG")])));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let filter = PortFilter::parse("PRODUCT:tigard*").unwrap();
        assert!(filter.matches(&attrs(&[("product", "TIGARD V1.1")])));
    }

    #[test]
    fn quoted_patterns_keep_whitespace() {
        let filter = PortFilter::parse(r#"product:"Dual RS232*""#).unwrap();
        assert!(filter.matches(&attrs(&[("product", "Dual RS232-HS")])));
        assert!(!filter.matches(&attrs(&[("product", "Dual")])));
    }

    #[test]
    fn unterminated_quote_is_invalid() {
        let err = PortFilter::parse(r#"product:"oops"#).unwrap_err();
        assert!(matches!(err, Error::FilterInvalid(_)));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let filter = PortFilter::parse("name:ttyusb?").unwrap();
        assert!(filter.matches(&attrs(&[("name", "ttyUSB0")])));
        assert!(!filter.matches(&attrs(&[("name", "ttyUSB10")])));
    }

    #[test]
    fn matched_keys_reports_hit_attributes() {
        let filter = PortFilter::parse("vid:0403 *uart*").unwrap();
        let a = attrs(&[
            ("vid", "0403"),
            ("product", "Quad UART"),
            ("serial_number", "A123"),
        ]);
        let keys = filter.matched_keys(&a);
        assert!(keys.contains("vid"));
        assert!(keys.contains("product"));
        assert!(!keys.contains("serial_number"));
    }
}
