//! Parser for `iptables -L -n [-v -x] [--line-numbers]` output.

use std::net::Ipv4Addr;

/// One parsed rule line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListedRule {
    /// Rule number, when listed with `--line-numbers`
    pub num: Option<u32>,
    pub packets: u64,
    pub bytes: u64,
    pub target: String,
    pub source: String,
    pub destination: String,
    /// Text between `/*` and `*/`
    pub comment: Option<String>,
}

impl ListedRule {
    /// The host address the rule is about: source, else destination.
    /// The wildcard address never counts.
    pub fn host_ip(&self) -> Option<Ipv4Addr> {
        parse_host(&self.source).or_else(|| parse_host(&self.destination))
    }

    pub fn source_ip(&self) -> Option<Ipv4Addr> {
        parse_host(&self.source)
    }

    pub fn destination_ip(&self) -> Option<Ipv4Addr> {
        parse_host(&self.destination)
    }

    /// Exact comment match.
    pub fn has_comment(&self, tag: &str) -> bool {
        self.comment.as_deref() == Some(tag)
    }

    pub fn comment_contains(&self, needle: &str) -> bool {
        self.comment.as_deref().is_some_and(|c| c.contains(needle))
    }
}

fn parse_host(addr: &str) -> Option<Ipv4Addr> {
    let host = addr.split('/').next()?;
    let ip: Ipv4Addr = host.parse().ok()?;
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// Parse a counter column. Accepts plain integers and `K`/`M`/`G`/`T`
/// suffixes (1024-based), as printed without `-x`.
pub fn parse_counter(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.chars().last()? {
        'K' | 'k' => (&raw[..raw.len() - 1], 1024u64),
        'M' | 'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'G' | 'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        'T' | 't' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (raw, 1),
    };

    if let Ok(n) = digits.parse::<u64>() {
        return n.checked_mul(multiplier);
    }

    let value: f64 = digits.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

/// Parse every rule line of a listing.
///
/// Column positions come from the header line, so plain, numbered and
/// verbose listings share one parser. Lines before a header, chain
/// banners and blank lines are skipped.
pub fn parse_listing(text: &str) -> Vec<ListedRule> {
    let mut columns: Vec<String> = Vec::new();
    let mut rules = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("Chain ") {
            continue;
        }

        let (body, comment) = split_comment(trimmed);
        let tokens: Vec<&str> = body.split_whitespace().collect();

        if matches!(tokens.first(), Some(&"num") | Some(&"pkts") | Some(&"target")) {
            columns = tokens.iter().map(|t| t.to_string()).collect();
            continue;
        }

        if columns.is_empty() || tokens.len() < columns.len() {
            continue;
        }

        let mut rule = ListedRule {
            comment,
            ..Default::default()
        };
        let mut valid = true;

        for (column, token) in columns.iter().zip(tokens.iter()) {
            match column.as_str() {
                "num" => match token.parse() {
                    Ok(n) => rule.num = Some(n),
                    Err(_) => valid = false,
                },
                "pkts" => rule.packets = parse_counter(token).unwrap_or(0),
                "bytes" => rule.bytes = parse_counter(token).unwrap_or(0),
                "target" => rule.target = token.to_string(),
                "source" => rule.source = token.to_string(),
                "destination" => rule.destination = token.to_string(),
                _ => {}
            }
        }

        if valid {
            rules.push(rule);
        }
    }

    rules
}

fn split_comment(line: &str) -> (&str, Option<String>) {
    match (line.find("/*"), line.rfind("*/")) {
        (Some(start), Some(end)) if end > start => {
            let comment = line[start + 2..end].trim().to_string();
            (&line[..start], Some(comment))
        }
        _ => (line, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERBOSE: &str = "\
Chain PORTAL_AUTH_USERS (1 references)
num      pkts      bytes target     prot opt in     out     source               destination
1         120    48213 ACCEPT     all  --  *      *       0.0.0.0/0            10.0.0.5             /* dl_C_S1 */
2          88     9120 ACCEPT     all  --  *      *       10.0.0.5             0.0.0.0/0            /* ul_C_S1 */
3           0        0 ACCEPT     all  --  *      *       0.0.0.0/0            0.0.0.0/0
";

    #[test]
    fn test_parse_verbose_listing() {
        let rules = parse_listing(VERBOSE);
        assert_eq!(rules.len(), 3);

        assert_eq!(rules[0].num, Some(1));
        assert_eq!(rules[0].bytes, 48213);
        assert_eq!(rules[0].packets, 120);
        assert_eq!(rules[0].target, "ACCEPT");
        assert!(rules[0].has_comment("dl_C_S1"));
        assert_eq!(rules[0].host_ip(), Some("10.0.0.5".parse().unwrap()));

        assert_eq!(rules[1].source_ip(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(rules[1].destination_ip(), None);

        assert_eq!(rules[2].comment, None);
        assert_eq!(rules[2].host_ip(), None);
    }

    #[test]
    fn test_parse_plain_listing() {
        let text = "\
Chain FORWARD (policy DROP)
num  target     prot opt source               destination
1    PORTAL_TEMP_ACCESS  all  --  0.0.0.0/0            0.0.0.0/0
2    PORTAL_AUTH_USERS  all  --  0.0.0.0/0            0.0.0.0/0
";
        let rules = parse_listing(text);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].target, "PORTAL_TEMP_ACCESS");
        assert_eq!(rules[1].num, Some(2));
        assert_eq!(rules[1].bytes, 0);
    }

    #[test]
    fn test_comment_with_spaces() {
        let text = "\
num   pkts bytes target     prot opt in     out     source               destination
1     0     0 RETURN     all  --  *      *       10.0.0.9             0.0.0.0/0            /* C_S2 */
";
        let rules = parse_listing(text);
        assert_eq!(rules[0].comment.as_deref(), Some("C_S2"));
        assert!(rules[0].comment_contains("C_"));
    }

    #[test]
    fn test_parse_counter_suffixes() {
        assert_eq!(parse_counter("512"), Some(512));
        assert_eq!(parse_counter("12K"), Some(12 * 1024));
        assert_eq!(parse_counter("3M"), Some(3 * 1024 * 1024));
        assert_eq!(parse_counter("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_counter("1.5K"), Some(1536));
        assert_eq!(parse_counter(""), None);
        assert_eq!(parse_counter("abc"), None);
    }

    #[test]
    fn test_suffixed_counters_in_listing() {
        let text = "\
num   pkts bytes target     prot opt in     out     source               destination
1     4K   51M ACCEPT     all  --  *      *       10.0.0.7             0.0.0.0/0
";
        let rules = parse_listing(text);
        assert_eq!(rules[0].bytes, 51 * 1024 * 1024);
        assert_eq!(rules[0].packets, 4 * 1024);
    }
}
