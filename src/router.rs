//! Binding-rule matching for the four exchange types.
//!
//! All functions here are pure; the virtual host picks `match_route` or
//! `match_headers` from the exchange type and applies it to every binding.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reserved binding argument selecting the headers match mode.
pub const X_MATCH: &str = "x-match";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        };
        f.write_str(name)
    }
}

impl FromStr for ExchangeType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeType::Direct),
            "fanout" => Ok(ExchangeType::Fanout),
            "topic" => Ok(ExchangeType::Topic),
            "headers" => Ok(ExchangeType::Headers),
            _ => Err(crate::Error::InvalidConfig("unknown exchange type")),
        }
    }
}

/// Matches a routing key against a binding key for key-based exchanges.
///
/// Headers exchanges never match here; they route through [`match_headers`].
pub fn match_route(kind: ExchangeType, routing_key: &str, binding_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => routing_key == binding_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => match_topic(routing_key, binding_key),
        ExchangeType::Headers => false,
    }
}

/// Dot-separated topic match: `*` is exactly one segment, `#` swallows
/// everything from its position onwards (including nothing).
pub fn match_topic(routing_key: &str, pattern: &str) -> bool {
    let mut keys = routing_key.split('.');
    for segment in pattern.split('.') {
        if segment == "#" {
            return true;
        }
        let key = match keys.next() {
            Some(key) => key,
            None => return false,
        };
        if segment != "*" && segment != key {
            return false;
        }
    }
    keys.next().is_none()
}

/// Matches message headers against a headers-exchange binding.
pub fn match_headers(headers: &HashMap<String, String>, binding_args: &HashMap<String, String>) -> bool {
    let match_any = binding_args
        .get(X_MATCH)
        .map(|mode| mode.eq_ignore_ascii_case("any"))
        .unwrap_or(false);

    let mut predicates = binding_args.iter().filter(|(k, _)| k.as_str() != X_MATCH).peekable();
    if predicates.peek().is_none() {
        return true;
    }

    let satisfied = |(k, v): (&String, &String)| headers.get(k) == Some(v);
    if match_any {
        predicates.any(satisfied)
    } else {
        predicates.all(satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn direct_is_exact_equality() {
        assert!(match_route(ExchangeType::Direct, "orders", "orders"));
        assert!(match_route(ExchangeType::Direct, "", ""));
        assert!(!match_route(ExchangeType::Direct, "orders", "Orders"));
        assert!(!match_route(ExchangeType::Direct, "orders.eu", "orders"));
    }

    #[test]
    fn fanout_always_matches() {
        assert!(match_route(ExchangeType::Fanout, "anything", ""));
        assert!(match_route(ExchangeType::Fanout, "", "ignored"));
    }

    #[test]
    fn headers_type_never_matches_by_key() {
        assert!(!match_route(ExchangeType::Headers, "k", "k"));
    }

    #[test]
    fn topic_wildcards() {
        assert!(match_route(ExchangeType::Topic, "kern.disk.sda", "kern.disk.#"));
        assert!(!match_route(ExchangeType::Topic, "kern.cpu", "kern.disk.#"));
        assert!(match_route(ExchangeType::Topic, "a.b", "*.b"));
        assert!(match_route(ExchangeType::Topic, "a", "#"));
        assert!(match_route(ExchangeType::Topic, "kern.disk", "kern.disk.#"));
        assert!(match_route(ExchangeType::Topic, "user.created", "user.*"));
        assert!(!match_route(ExchangeType::Topic, "user.created.eu", "user.*"));
        assert!(!match_route(ExchangeType::Topic, "user", "user.*"));
        assert!(!match_route(ExchangeType::Topic, "a.b.c", "a.b"));
        assert!(match_route(ExchangeType::Topic, "a.x.c", "a.*.c"));
    }

    #[test]
    fn headers_all_and_any() {
        let binding = map(&[("priority", "high"), ("type", "alert")]);
        assert!(match_headers(&map(&[("priority", "high"), ("type", "alert")]), &binding));
        assert!(!match_headers(&map(&[("priority", "high")]), &binding));

        let any = map(&[(X_MATCH, "any"), ("priority", "high"), ("type", "alert")]);
        assert!(match_headers(&map(&[("priority", "high")]), &any));
        assert!(!match_headers(&map(&[("priority", "low")]), &any));

        let explicit_all = map(&[(X_MATCH, "all"), ("priority", "high")]);
        assert!(match_headers(&map(&[("priority", "high"), ("extra", "1")]), &explicit_all));
    }

    #[test]
    fn headers_without_predicates_match() {
        assert!(match_headers(&map(&[("a", "b")]), &HashMap::new()));
        assert!(match_headers(&HashMap::new(), &map(&[(X_MATCH, "any")])));
    }

    #[test]
    fn headers_values_are_case_sensitive() {
        let binding = map(&[("priority", "high")]);
        assert!(!match_headers(&map(&[("priority", "HIGH")]), &binding));
    }

    #[test]
    fn exchange_type_parses() {
        assert_eq!("TOPIC".parse::<ExchangeType>().unwrap(), ExchangeType::Topic);
        assert!("bogus".parse::<ExchangeType>().is_err());
    }
}
