use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::extract::{extract, ExtractError, Transcript};
use crate::render::{PageRenderer, RenderError};

// ── Error types ──────────────────────────────────────────────────────────────

/// Which stage of the pipeline failed, and why.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("could not render page: {0}")]
    Render(#[from] RenderError),
    #[error("could not extract conversation: {0}")]
    Extract(#[from] ExtractError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidLink(pub String);

// ── Link validation ──────────────────────────────────────────────────────────

/// Accept http(s) links whose host is in `allowed_hosts` (or a subdomain of
/// one). An empty list accepts any host.
pub fn validate_link(link: &str, allowed_hosts: &[String]) -> Result<Url, InvalidLink> {
    let parsed = Url::parse(link.trim()).map_err(|_| InvalidLink("Invalid URL".to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(InvalidLink("Only http and https links are allowed".to_string()));
    }
    let host = parsed.host_str().unwrap_or("").to_lowercase();
    if host.is_empty() {
        return Err(InvalidLink("Link has no host".to_string()));
    }
    if allowed_hosts.is_empty()
        || allowed_hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{}", allowed)))
    {
        return Ok(parsed);
    }
    Err(InvalidLink(format!(
        "Only links to {} are allowed",
        allowed_hosts.join(", ")
    )))
}

// ── Render + extract ─────────────────────────────────────────────────────────

pub async fn scrape_link(
    renderer: &dyn PageRenderer,
    url: &str,
    timeout: Duration,
) -> Result<Transcript, PipelineError> {
    debug!(url, ?timeout, "scraping link");
    let page = renderer.render(url, timeout).await?;

    let transcript = extract(&page.html).map_err(|e| {
        warn!(url, error = %e, "extraction failed");
        e
    })?;

    info!(
        url,
        title = %transcript.title,
        prompts = transcript.prompts.len(),
        responses = transcript.responses.len(),
        "extracted conversation"
    );
    Ok(transcript)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::render::{PageRenderer, RenderError, RenderedPage};

    /// Serves fixed HTML, or times out when given `None`.
    pub struct StaticRenderer(pub Option<String>);

    #[async_trait]
    impl PageRenderer for StaticRenderer {
        async fn render(&self, url: &str, timeout: Duration) -> Result<RenderedPage, RenderError> {
            match &self.0 {
                Some(html) => Ok(RenderedPage {
                    url: url.to_string(),
                    html: html.clone(),
                }),
                None => Err(RenderError::Timeout(timeout)),
            }
        }
    }

    pub fn share_page(title: &str, prompts: &[&str], responses: &[&str]) -> String {
        let mut body = String::new();
        for p in prompts {
            body.push_str(&format!(
                r#"<div data-message-author-role="user"><div>{}</div></div>"#,
                p
            ));
        }
        for r in responses {
            body.push_str(&format!(
                r#"<div data-message-author-role="assistant"><p>{}</p></div>"#,
                r
            ));
        }
        format!(
            "<html><head><title>ChatGPT - {}</title></head><body>{}</body></html>",
            title, body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{share_page, StaticRenderer};
    use super::*;

    fn hosts() -> Vec<String> {
        vec!["chatgpt.com".to_string(), "chat.openai.com".to_string()]
    }

    #[tokio::test]
    async fn renders_and_extracts() {
        let renderer = StaticRenderer(Some(share_page("My Chat", &["A", "B"], &["x", "y"])));
        let t = scrape_link(&renderer, "https://chatgpt.com/share/1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(t.title, "My Chat");
        assert_eq!(t.prompts.len(), 2);
        assert_eq!(t.responses.len(), 2);
    }

    #[tokio::test]
    async fn render_failure_is_tagged() {
        let renderer = StaticRenderer(None);
        let err = scrape_link(&renderer, "https://chatgpt.com/share/1", Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Render(RenderError::Timeout(_))));
    }

    #[tokio::test]
    async fn extraction_failure_is_tagged() {
        let renderer = StaticRenderer(Some(share_page("Empty", &[], &["x"])));
        let err = scrape_link(&renderer, "https://chatgpt.com/share/1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Extract(ExtractError::NoPrompts)));
    }

    #[tokio::test]
    async fn count_mismatch_passes_through() {
        let renderer = StaticRenderer(Some(share_page("Uneven", &["a", "b", "c"], &["x", "y"])));
        let t = scrape_link(&renderer, "https://chatgpt.com/share/1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!((t.prompts.len(), t.responses.len()), (3, 2));
        assert!(t.into_pairs().is_err());
    }

    #[test]
    fn accepts_allowed_hosts_and_subdomains() {
        assert!(validate_link("https://chatgpt.com/share/abc", &hosts()).is_ok());
        assert!(validate_link(" https://chat.openai.com/share/abc ", &hosts()).is_ok());
        assert!(validate_link("https://www.chatgpt.com/share/abc", &hosts()).is_ok());
    }

    #[test]
    fn rejects_bad_links() {
        assert_eq!(
            validate_link("not a url", &hosts()).unwrap_err(),
            InvalidLink("Invalid URL".to_string())
        );
        assert!(validate_link("ftp://chatgpt.com/share/abc", &hosts()).is_err());
        assert!(validate_link("https://evilchatgpt.com/share/abc", &hosts()).is_err());
        assert!(validate_link("https://example.com/", &hosts()).is_err());
    }

    #[test]
    fn empty_allow_list_accepts_any_host() {
        assert!(validate_link("http://localhost:8080/page", &[]).is_ok());
    }
}
