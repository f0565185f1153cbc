//! HTML parsing is an explicit Non-goal (§1); this module defines only
//! the boundary the per-task state machine depends on, plus a minimal
//! default implementation that lets the state machine's tests run
//! without real parsing logic.

use async_trait::async_trait;

/// The parser's classification of a fetched page, beyond the Session's
/// own blocked/not-found signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedKind {
    /// Parsed successfully, content is sane.
    Ok,
    /// A captcha challenge page.
    Captcha,
    /// An API-level block marker embedded in the body.
    ApiBlock,
    /// The body parsed as structurally empty.
    Empty,
    /// The parser could not make sense of the body at all.
    ParseError,
    /// The expected title field was missing.
    TitleMissing,
}

/// The result of parsing a fetched page.
#[derive(Debug, Clone, Copy)]
pub struct ParsedPage {
    /// The page's classification.
    pub kind: ParsedKind,
    /// Whether parsed content passed sanity checks (e.g. price currency
    /// matches the expected market). Only meaningful when `kind == Ok`.
    pub sanity_ok: bool,
}

/// The abstract surface the per-task state machine depends on.
#[async_trait]
pub trait PageParser: Send + Sync {
    /// Parses a fetched body into a [`ParsedPage`].
    async fn parse(&self, body: &str) -> ParsedPage;
}

/// A placeholder parser: every non-empty body is `Ok` and sane. Lets the
/// retry state machine (§4.F) run end-to-end in tests without depending
/// on real HTML parsing, which is out of scope here.
pub struct PassthroughParser;

#[async_trait]
impl PageParser for PassthroughParser {
    async fn parse(&self, body: &str) -> ParsedPage {
        if body.trim().is_empty() {
            return ParsedPage {
                kind: ParsedKind::Empty,
                sanity_ok: false,
            };
        }
        ParsedPage {
            kind: ParsedKind::Ok,
            sanity_ok: true,
        }
    }
}
