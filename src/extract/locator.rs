//! Locator strategies for finding a value inside rendered page content.
//!
//! The portal's markup churns, so no field depends on a single selector.
//! Each logical field carries an ordered list of locators; the first one
//! that yields a usable value wins. A locator that fails to compile or
//! matches nothing is a silent non-match, never an error.

use scraper::{ElementRef, Selector};

/// One strategy for pulling a raw string out of an element subtree.
#[derive(Debug, Clone)]
pub enum Locator {
    /// Text content of the first descendant matching a selector
    Css { selector: Option<Selector> },
    /// An attribute of the first descendant matching a selector
    CssAttr {
        selector: Option<Selector>,
        attr: String,
    },
    /// Text of the first matching descendant whose text contains a keyword
    /// (case-insensitive)
    CssContains {
        selector: Option<Selector>,
        needle: String,
    },
    /// The scope element's own full text
    OwnText,
}

impl Locator {
    pub fn css(selector: &str) -> Self {
        Self::Css {
            selector: Selector::parse(selector).ok(),
        }
    }

    pub fn attr(selector: &str, attr: &str) -> Self {
        Self::CssAttr {
            selector: Selector::parse(selector).ok(),
            attr: attr.to_string(),
        }
    }

    pub fn contains(selector: &str, needle: &str) -> Self {
        Self::CssContains {
            selector: Selector::parse(selector).ok(),
            needle: needle.to_lowercase(),
        }
    }

    /// Try this strategy against an element scope. Returns a trimmed,
    /// whitespace-normalized string, or `None` on any kind of miss.
    pub fn try_match(&self, scope: ElementRef<'_>) -> Option<String> {
        let raw = match self {
            Self::Css { selector } => {
                let selector = selector.as_ref()?;
                scope.select(selector).next().map(element_text)
            }
            Self::CssAttr { selector, attr } => {
                let selector = selector.as_ref()?;
                scope
                    .select(selector)
                    .next()
                    .and_then(|el| el.value().attr(attr))
                    .map(clean_text)
            }
            Self::CssContains { selector, needle } => {
                let selector = selector.as_ref()?;
                scope
                    .select(selector)
                    .map(element_text)
                    .find(|text| text.to_lowercase().contains(needle))
            }
            Self::OwnText => Some(element_text(scope)),
        }?;

        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    }
}

/// Collected text of an element with entities decoded and whitespace
/// collapsed.
pub fn element_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

fn clean_text(raw: &str) -> String {
    raw.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
