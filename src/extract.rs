use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

// ── Constants ────────────────────────────────────────────────────────────────

/// Prefix the share page puts in front of the conversation title.
pub const TITLE_PREFIX: &str = "ChatGPT - ";

/// Matches one user turn; its visible text is the prompt.
pub const USER_TURN_SELECTOR: &str = r#"div[data-message-author-role="user"]"#;
/// Matches one assistant turn; its inner HTML is the response. The renderer
/// waits for both selectors before handing the page over.
pub const ASSISTANT_TURN_SELECTOR: &str = r#"div[data-message-author-role="assistant"]"#;

// ── Lazy static selectors ────────────────────────────────────────────────────

static TITLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());

static USER_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse(USER_TURN_SELECTOR).unwrap());

static ASSISTANT_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(ASSISTANT_TURN_SELECTOR).unwrap());

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("page has no <title> element")]
    MissingTitle,
    #[error("page title is empty")]
    EmptyTitle,
    #[error("page has no user messages")]
    NoPrompts,
    #[error("page has no assistant messages")]
    NoResponses,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("found {prompts} prompts but {responses} responses")]
pub struct CountMismatch {
    pub prompts: usize,
    pub responses: usize,
}

// ── Public result types ──────────────────────────────────────────────────────

/// One side of a conversational turn.
///
/// `raw` is plain text for prompts and an HTML fragment for responses;
/// `normalized` is always lower-cased visible text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub raw: String,
    pub normalized: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessagePair {
    pub prompt_raw: String,
    pub response_raw: String,
    pub prompt_normalized: String,
    pub response_normalized: String,
}

/// Result of one extraction run. Prompt and response counts are not
/// reconciled here; see [`Transcript::into_pairs`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcript {
    pub title: String,
    pub prompts: Vec<Turn>,
    pub responses: Vec<Turn>,
}

impl Transcript {
    /// Pair the i-th prompt with the i-th response.
    pub fn into_pairs(self) -> Result<Vec<MessagePair>, CountMismatch> {
        if self.prompts.len() != self.responses.len() {
            return Err(CountMismatch {
                prompts: self.prompts.len(),
                responses: self.responses.len(),
            });
        }

        Ok(self
            .prompts
            .into_iter()
            .zip(self.responses)
            .map(|(prompt, response)| MessagePair {
                prompt_raw: prompt.raw,
                response_raw: response.raw,
                prompt_normalized: prompt.normalized,
                response_normalized: response.normalized,
            })
            .collect())
    }
}

// ── Main extraction pipeline ─────────────────────────────────────────────────

pub fn extract(html: &str) -> Result<Transcript, ExtractError> {
    let document = Html::parse_document(html);

    let title_el = document
        .select(&TITLE_SEL)
        .next()
        .ok_or(ExtractError::MissingTitle)?;
    let title = strip_title_prefix(&collect_text(title_el)).to_string();
    if title.is_empty() {
        return Err(ExtractError::EmptyTitle);
    }

    let prompts: Vec<Turn> = document.select(&USER_SEL).map(prompt_turn).collect();
    if prompts.is_empty() {
        return Err(ExtractError::NoPrompts);
    }

    let responses: Vec<Turn> = document.select(&ASSISTANT_SEL).map(response_turn).collect();
    if responses.is_empty() {
        return Err(ExtractError::NoResponses);
    }

    Ok(Transcript {
        title,
        prompts,
        responses,
    })
}

/// Trim the title and drop every leading occurrence of [`TITLE_PREFIX`].
pub fn strip_title_prefix(title: &str) -> &str {
    let mut rest = title.trim_start();
    while let Some(stripped) = rest.strip_prefix(TITLE_PREFIX) {
        rest = stripped.trim_start();
    }
    rest.trim_end()
}

// ── Turn builders ────────────────────────────────────────────────────────────

fn prompt_turn(el: ElementRef<'_>) -> Turn {
    let raw = collect_text(el);
    let normalized = raw.to_lowercase();
    Turn { raw, normalized }
}

fn response_turn(el: ElementRef<'_>) -> Turn {
    Turn {
        raw: el.inner_html(),
        normalized: collect_text(el).to_lowercase(),
    }
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

/// Recursively collect all text from an element and its descendants.
fn collect_text(el: ElementRef<'_>) -> String {
    use scraper::node::Node;
    let mut text = String::new();
    for child in el.children() {
        match child.value() {
            Node::Text(t) => text.push_str(&*t.text),
            Node::Element(_) => {
                if let Some(child_el) = ElementRef::wrap(child) {
                    text.push_str(&collect_text(child_el));
                }
            }
            _ => {}
        }
    }
    text
}
