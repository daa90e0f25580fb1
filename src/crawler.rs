//! User-agent based search crawler classification

use crate::config::CrawlerConfig;

/// Verdict for a single user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CrawlerVerdict {
    /// Matched one of the generic spider fragments
    pub is_crawler: bool,
    /// Matched one of the allow-listed spider fragments
    pub is_allowed: bool,
}

impl CrawlerVerdict {
    /// Crawlers that are not allow-listed never see mirrored content
    pub fn is_blocked(&self) -> bool {
        self.is_crawler && !self.is_allowed
    }
}

/// Case-insensitive substring classifier over two fragment lists
#[derive(Debug, Clone, Default)]
pub struct CrawlerClassifier {
    spiders: Vec<String>,
    good_spiders: Vec<String>,
}

impl CrawlerClassifier {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            spiders: lowercase_fragments(&config.spiders),
            good_spiders: lowercase_fragments(&config.good_spiders),
        }
    }

    pub fn classify(&self, user_agent: &str) -> CrawlerVerdict {
        let ua = user_agent.to_lowercase();
        CrawlerVerdict {
            is_crawler: self.spiders.iter().any(|s| ua.contains(s.as_str())),
            is_allowed: self.good_spiders.iter().any(|s| ua.contains(s.as_str())),
        }
    }
}

fn lowercase_fragments(fragments: &[String]) -> Vec<String> {
    fragments
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> CrawlerClassifier {
        CrawlerClassifier::new(&CrawlerConfig {
            spiders: vec!["spider".to_string(), "Bot".to_string(), " ".to_string()],
            good_spiders: vec!["Baiduspider".to_string(), "Googlebot".to_string()],
        })
    }

    #[test]
    fn test_browser_is_not_crawler() {
        let verdict = classifier()
            .classify("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0");
        assert_eq!(verdict, CrawlerVerdict::default());
        assert!(!verdict.is_blocked());
    }

    #[test]
    fn test_untrusted_crawler_is_blocked() {
        let verdict = classifier().classify("Mozilla/5.0 (compatible; AhrefsBot/7.0)");
        assert!(verdict.is_crawler);
        assert!(!verdict.is_allowed);
        assert!(verdict.is_blocked());
    }

    #[test]
    fn test_good_crawler_is_case_insensitive() {
        let verdict = classifier().classify("Mozilla/5.0 (compatible; BAIDUSPIDER/2.0)");
        assert!(verdict.is_crawler);
        assert!(verdict.is_allowed);
        assert!(!verdict.is_blocked());
    }

    #[test]
    fn test_blank_fragments_are_ignored() {
        let verdict = classifier().classify("curl/8.0");
        assert!(!verdict.is_crawler);
    }
}
