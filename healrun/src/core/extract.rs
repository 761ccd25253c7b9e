//! Tagged-block extraction from raw model replies.
//!
//! Every operation here is total: a reply without a usable block yields an
//! empty result, never an error. Deciding whether the result is acceptable is
//! left to [`crate::core::directive`].

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::markup::{Element, parse_element};

/// Root tags a reply block may use.
pub const KNOWN_ROOT_TAGS: [&str; 3] = ["root", "commands", "files"];

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = KNOWN_ROOT_TAGS
        .iter()
        .map(|tag| format!("<{tag}>.*?</{tag}>"))
        .collect();
    Regex::new(&format!("(?s){}", alternatives.join("|"))).unwrap()
});

/// Locate the first `<root>…</root>`-style block of a known root tag.
///
/// The search is non-greedy, so prose or a second block after the first
/// closing tag is never included. Inner structure is not checked.
pub fn extract_structured_block(text: &str) -> Option<&str> {
    BLOCK_RE.find(text).map(|m| m.as_str())
}

/// Parse the located block into its root element, if both steps succeed.
pub fn extract_root(text: &str) -> Option<Element> {
    let block = extract_structured_block(text)?;
    match parse_element(block) {
        Ok(root) => Some(root),
        Err(err) => {
            debug!(err = %err, "discarding malformed block");
            None
        }
    }
}

/// Map each child tag of the root block to its text content.
///
/// Values are kept verbatim. Repeated tags keep the last value. Missing or
/// malformed blocks produce an empty map.
pub fn extract_fields(text: &str) -> BTreeMap<String, String> {
    extract_root(text)
        .map(|root| fields_of(&root))
        .unwrap_or_default()
}

pub(crate) fn fields_of(element: &Element) -> BTreeMap<String, String> {
    element
        .children
        .iter()
        .map(|child| (child.tag.clone(), child.text.clone()))
        .collect()
}

/// Collect every `<command>` child of the root block in document order.
///
/// Duplicates are preserved; surrounding whitespace is trimmed.
pub fn extract_command_list(text: &str) -> Vec<String> {
    extract_root(text)
        .map(|root| {
            root.children_named("command")
                .map(|command| command.text.trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}
