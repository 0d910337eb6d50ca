//! Link-aware prompting
//!
//! URLs in the latest user turn are fetched and their text is appended to
//! that turn so the model can answer questions about linked pages. Pages
//! are treated as opaque text; PDFs are skipped.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::protocol::{Role, Turn};

/// Maximum characters of page text inlined per URL
pub const MAX_PAGE_CHARS: usize = 3000;

lazy_static! {
    static ref URL: Regex = Regex::new(
        r"http[s]?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\(\),]|(?:%[0-9a-fA-F][0-9a-fA-F]))+"
    )
    .expect("failed to compile URL pattern");
}

/// All http(s) URLs in `text`, in order of appearance
pub fn extract_urls(text: &str) -> Vec<String> {
    URL.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Default a missing scheme to https
pub fn resolve_url_scheme(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{}", url.trim_start_matches('/'))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Append the content of every URL in the last user turn to that turn.
///
/// Returns how many URLs were inlined. Unreachable URLs and PDFs are
/// skipped.
pub async fn augment_with_links(conversation: &mut [Turn], fetcher: &dyn Fetcher) -> usize {
    let Some(last) = conversation.last_mut() else {
        return 0;
    };
    if last.role != Role::User {
        return 0;
    }

    let mut inlined = 0;
    let mut statement = last.content.trim().to_string();
    for url in extract_urls(&last.content) {
        let url = resolve_url_scheme(&url);
        let fetched = match fetcher.fetch(&url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(url = %url, error = %e, "Unable to load URL");
                continue;
            }
        };
        if fetched.is_pdf(&url) {
            debug!(url = %url, "Skipping PDF link");
            continue;
        }

        let text = String::from_utf8_lossy(&fetched.bytes);
        statement.push_str(&format!("\n{} contains the following content:", url));
        statement.push_str("\n\n---\n\n");
        statement.push_str(truncate_chars(&text, MAX_PAGE_CHARS));
        statement.push_str("\n\n---\n\n");
        inlined += 1;
    }

    if inlined > 0 {
        last.content = statement;
    }
    inlined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, Fetched};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MapFetcher(HashMap<String, Fetched>);

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Fetched, FetchError> {
            self.0.get(url).cloned().ok_or(FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn page(text: &str, content_type: &str) -> Fetched {
        Fetched {
            bytes: text.as_bytes().to_vec(),
            content_type: Some(content_type.to_string()),
        }
    }

    #[test]
    fn test_extract_urls() {
        let text = "What is the difference between https://arxiv.org/pdf/2201.11903.pdf and http://example.com/a?b=1";
        assert_eq!(
            extract_urls(text),
            vec!["https://arxiv.org/pdf/2201.11903.pdf", "http://example.com/a?b=1"]
        );
        assert!(extract_urls("no links here").is_empty());
    }

    #[test]
    fn test_resolve_url_scheme() {
        assert_eq!(resolve_url_scheme("https://a.example"), "https://a.example");
        assert_eq!(resolve_url_scheme("a.example/x"), "https://a.example/x");
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn test_augment_inlines_pages_and_skips_pdfs() {
        let mut pages = HashMap::new();
        pages.insert("https://blog.example/post".to_string(), page("Post body", "text/html"));
        pages.insert("https://arxiv.org/x.pdf".to_string(), page("%PDF", "application/pdf"));
        let fetcher = MapFetcher(pages);

        let mut conversation = vec![Turn::user(
            "compare https://blog.example/post https://arxiv.org/x.pdf https://down.example",
        )];
        let inlined = augment_with_links(&mut conversation, &fetcher).await;

        assert_eq!(inlined, 1);
        let content = &conversation[0].content;
        assert!(content.contains("https://blog.example/post contains the following content:"));
        assert!(content.contains("\n\n---\n\nPost body\n\n---\n\n"));
        assert!(!content.contains("%PDF"));
    }

    #[tokio::test]
    async fn test_augment_ignores_bot_turns() {
        let fetcher = MapFetcher(HashMap::new());
        let mut conversation = vec![Turn::bot("see https://x.example")];
        assert_eq!(augment_with_links(&mut conversation, &fetcher).await, 0);
        assert_eq!(conversation[0].content, "see https://x.example");
    }
}
