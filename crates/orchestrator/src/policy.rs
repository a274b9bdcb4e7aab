use crawlhub_core::{AppError, PolicyConfig, SubscriptionTier, WorkerKind};
use url::Url;

/// Trim, default to secure transport, reject anything that is not a usable
/// web URL.
pub fn normalize_url(raw: &str) -> Result<Url, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::PolicyViolation("empty URL".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| AppError::PolicyViolation(format!("malformed URL '{}': {}", trimmed, e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::PolicyViolation(format!(
            "unsupported scheme '{}' in '{}'",
            url.scheme(),
            trimmed
        )));
    }

    if url.host_str().is_none() {
        return Err(AppError::PolicyViolation(format!(
            "URL '{}' has no host",
            trimmed
        )));
    }

    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainVerdict {
    Allow,
    Block,
    /// Requires at least the given subscription tier.
    Restricted(SubscriptionTier),
}

/// Domain allow/block/restricted table, loaded once from configuration.
#[derive(Debug, Clone)]
pub struct DomainPolicy {
    blocked: Vec<String>,
    restricted: Vec<String>,
}

impl DomainPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            blocked: config.blocked_domains.clone(),
            restricted: config.restricted_domains.clone(),
        }
    }

    pub fn verdict(&self, host: &str) -> DomainVerdict {
        let host = host.to_lowercase();
        if self.blocked.iter().any(|d| domain_matches(&host, d)) {
            return DomainVerdict::Block;
        }
        if self.restricted.iter().any(|d| domain_matches(&host, d)) {
            return DomainVerdict::Restricted(SubscriptionTier::Pro);
        }
        DomainVerdict::Allow
    }
}

/// Suffix match: `sub.example.test` matches a policy entry `example.test`.
fn domain_matches(host: &str, entry: &str) -> bool {
    host == entry || host.ends_with(&format!(".{}", entry))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlClass {
    StaticHtml,
    Scripted,
    MobileApi,
    Unknown,
}

/// Deterministic URL classification backing the `Auto` worker-kind election.
pub fn classify_url(url: &Url) -> UrlClass {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let path = url.path().to_lowercase();

    if host.starts_with("api.")
        || host.starts_with("m.")
        || path.split('/').any(|segment| segment == "api")
    {
        return UrlClass::MobileApi;
    }

    if let Some(ext) = path.rsplit('.').next().filter(|_| path.contains('.')) {
        match ext {
            "html" | "htm" | "shtml" | "xhtml" | "txt" | "md" | "xml" => {
                return UrlClass::StaticHtml
            }
            "php" | "asp" | "aspx" | "jsp" => return UrlClass::Scripted,
            _ => {}
        }
    }

    if url.query().is_some() {
        return UrlClass::Scripted;
    }

    UrlClass::Unknown
}

pub fn kind_for_class(class: UrlClass) -> WorkerKind {
    match class {
        UrlClass::StaticHtml => WorkerKind::HttpClient,
        UrlClass::Scripted => WorkerKind::HeadlessBrowser,
        UrlClass::MobileApi => WorkerKind::MobileBridge,
        UrlClass::Unknown => WorkerKind::Intelligent,
    }
}

/// Capability rank used when one job mixes URL classes; the job gets the
/// most capable kind any of its URLs needs.
fn capability_rank(kind: WorkerKind) -> u8 {
    match kind {
        WorkerKind::HttpClient => 0,
        WorkerKind::MobileBridge => 1,
        WorkerKind::HeadlessBrowser => 2,
        WorkerKind::Intelligent => 3,
        WorkerKind::Universal => 4,
    }
}

pub fn elect_worker_kind(urls: &[Url]) -> WorkerKind {
    urls.iter()
        .map(|u| kind_for_class(classify_url(u)))
        .max_by_key(|k| capability_rank(*k))
        .unwrap_or(WorkerKind::Intelligent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DomainPolicy {
        DomainPolicy::new(&PolicyConfig {
            blocked_domains: vec!["blocked.test".to_string()],
            restricted_domains: vec!["premium.test".to_string()],
        })
    }

    #[test]
    fn normalize_defaults_to_https() {
        let url = normalize_url("  example.test/page  ").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("example.test"));
    }

    #[test]
    fn normalize_rejects_non_web_schemes() {
        assert!(matches!(
            normalize_url("ftp://example.test/file"),
            Err(AppError::PolicyViolation(_))
        ));
        assert!(matches!(
            normalize_url("not a url at all \u{0}"),
            Err(AppError::PolicyViolation(_))
        ));
    }

    #[test]
    fn blocked_domains_match_subdomains() {
        assert_eq!(policy().verdict("deep.sub.blocked.test"), DomainVerdict::Block);
        assert_eq!(policy().verdict("notblocked.test"), DomainVerdict::Allow);
        // No accidental suffix match on the bare string
        assert_eq!(policy().verdict("unblocked.test"), DomainVerdict::Allow);
    }

    #[test]
    fn restricted_domains_need_a_tier() {
        assert_eq!(
            policy().verdict("premium.test"),
            DomainVerdict::Restricted(SubscriptionTier::Pro)
        );
    }

    #[test]
    fn classification_table() {
        let cases = [
            ("https://a.test/page.html", UrlClass::StaticHtml),
            ("https://a.test/item.php", UrlClass::Scripted),
            ("https://a.test/list?page=2", UrlClass::Scripted),
            ("https://api.a.test/v1/items", UrlClass::MobileApi),
            ("https://a.test/api/v2/items", UrlClass::MobileApi),
            ("https://a.test/dashboard", UrlClass::Unknown),
        ];
        for (raw, expected) in cases {
            assert_eq!(classify_url(&Url::parse(raw).unwrap()), expected, "{}", raw);
        }
    }

    #[test]
    fn mixed_jobs_get_the_most_capable_kind() {
        let urls = vec![
            Url::parse("https://a.test/page.html").unwrap(),
            Url::parse("https://a.test/dashboard").unwrap(),
        ];
        assert_eq!(elect_worker_kind(&urls), WorkerKind::Intelligent);

        let urls = vec![Url::parse("https://a.test/page.html").unwrap()];
        assert_eq!(elect_worker_kind(&urls), WorkerKind::HttpClient);
    }
}
