//! Domain-based trust scoring on a 0-100 scale.

pub const TOP_TIER: u8 = 95;
pub const PROFESSIONAL_TIER: u8 = 90;
pub const ORG_TIER: u8 = 85;
pub const BASELINE: u8 = 80;

const SCHOLARLY_PUBLISHERS: &[&str] = &[
    "nature.com",
    "science.org",
    "sciencedirect.com",
    "springer.com",
    "wiley.com",
    "thelancet.com",
    "nejm.org",
    "cell.com",
];

const PROFESSIONAL_BODIES: &[&str] = &["ieee.org", "acm.org"];

/// Lower-cased host of `url`, without port or leading `www.`.
/// Falls back to the whole lower-cased string when no host can be found.
pub fn domain_of(url: &str) -> String {
    let lower = url.trim().to_lowercase();
    let without_scheme = match lower.find("://") {
        Some(idx) => &lower[idx + 3..],
        None => lower.as_str(),
    };
    let host_and_port = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    let host_and_port = host_and_port.rsplit('@').next().unwrap_or(host_and_port);
    let host = host_and_port.split(':').next().unwrap_or(host_and_port);
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

/// True when `domain` is `parent` or one of its subdomains.
pub fn is_within(domain: &str, parent: &str) -> bool {
    domain == parent || domain.ends_with(&format!(".{}", parent))
}

/// Score a URL by its domain. First matching tier wins.
pub fn score(url: &str) -> u8 {
    let domain = domain_of(url);

    if domain.contains(".gov") || domain.contains(".edu") {
        return TOP_TIER;
    }
    if SCHOLARLY_PUBLISHERS.iter().any(|p| is_within(&domain, p)) {
        return TOP_TIER;
    }
    if PROFESSIONAL_BODIES.iter().any(|p| is_within(&domain, p)) {
        return PROFESSIONAL_TIER;
    }
    if domain.contains(".org") {
        return ORG_TIER;
    }
    BASELINE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_domains() {
        assert_eq!(domain_of("https://www.Nature.com/articles/x"), "nature.com");
        assert_eq!(domain_of("http://user@data.gov.uk:8080/path?q=1"), "data.gov.uk");
        assert_eq!(domain_of("mit.edu/paper"), "mit.edu");
    }

    #[test]
    fn tiers_in_priority_order() {
        assert_eq!(score("https://mit.edu/paper"), 95);
        assert_eq!(score("https://www.census.gov/data"), 95);
        assert_eq!(score("https://www.nature.com/articles/abc"), 95);
        assert_eq!(score("https://www.science.org/doi/10.1126/x"), 95);
        assert_eq!(score("https://spectrum.ieee.org/ai"), 90);
        assert_eq!(score("https://dl.acm.org/doi/10.1145/1"), 90);
        assert_eq!(score("https://www.who.org/report"), 85);
        assert_eq!(score("https://randomblog.example/post"), 80);
    }

    #[test]
    fn lookalike_hosts_do_not_borrow_trust() {
        assert_eq!(score("https://notnature.com/fake"), 80);
        assert_eq!(score("https://ieee.org.example.net/"), 85);
    }
}
