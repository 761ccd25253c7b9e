//! Tolerant tree parser for the tagged blocks models emit.
//!
//! Models write XML-ish markup that is rarely well-formed XML: bare `&` in
//! shell commands, `<` in comparisons, stray prose after the root. The parser
//! accepts those, but still rejects structural damage (unterminated or
//! mismatched tags) so callers can re-prompt instead of acting on half a reply.

use thiserror::Error;

/// A parsed element. Attributes are accepted but not retained.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub tag: String,
    /// Concatenated direct character data (text and CDATA), entities decoded.
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// Direct children with the given tag, in document order.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkupError {
    #[error("unexpected end of input inside <{0}>")]
    UnexpectedEof(String),
    #[error("expected element at byte {0}")]
    ExpectedElement(usize),
    #[error("closing tag </{found}> does not match <{expected}>")]
    MismatchedClose { expected: String, found: String },
    #[error("malformed tag at byte {0}")]
    MalformedTag(usize),
    #[error("elements nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

const MAX_DEPTH: usize = 64;

/// Parse the first element in `input`, skipping a leading XML declaration,
/// comments and whitespace. Content after the root element is ignored.
pub fn parse_element(input: &str) -> Result<Element, MarkupError> {
    let mut parser = Parser { src: input, pos: 0 };
    parser.skip_misc();
    parser.element(0)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_misc(&mut self) {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            let terminator = if rest.starts_with("<?") {
                "?>"
            } else if rest.starts_with("<!--") {
                "-->"
            } else {
                return;
            };
            match rest.find(terminator) {
                Some(end) => self.pos += end + terminator.len(),
                None => {
                    self.pos = self.src.len();
                    return;
                }
            }
        }
    }

    fn element(&mut self, depth: usize) -> Result<Element, MarkupError> {
        if depth > MAX_DEPTH {
            return Err(MarkupError::TooDeep);
        }
        let start = self.pos;
        if !self.rest().starts_with('<') {
            return Err(MarkupError::ExpectedElement(start));
        }
        self.pos += 1;
        let tag = self.name().ok_or(MarkupError::MalformedTag(start))?;
        let self_closing = self.skip_attributes(&tag)?;
        let mut element = Element {
            tag,
            ..Element::default()
        };
        if self_closing {
            return Ok(element);
        }

        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(MarkupError::UnexpectedEof(element.tag));
            }
            if rest.starts_with("</") {
                let close_at = self.pos;
                self.pos += 2;
                let found = self.name().ok_or(MarkupError::MalformedTag(close_at))?;
                self.skip_whitespace();
                if !self.rest().starts_with('>') {
                    return Err(MarkupError::MalformedTag(close_at));
                }
                self.pos += 1;
                if found != element.tag {
                    return Err(MarkupError::MismatchedClose {
                        expected: element.tag,
                        found,
                    });
                }
                return Ok(element);
            }
            if let Some(body) = rest.strip_prefix("<![CDATA[") {
                let end = body
                    .find("]]>")
                    .ok_or_else(|| MarkupError::UnexpectedEof(element.tag.clone()))?;
                element.text.push_str(&body[..end]);
                self.pos += "<![CDATA[".len() + end + "]]>".len();
                continue;
            }
            if let Some(body) = rest.strip_prefix("<!--") {
                let end = body
                    .find("-->")
                    .ok_or_else(|| MarkupError::UnexpectedEof(element.tag.clone()))?;
                self.pos += "<!--".len() + end + "-->".len();
                continue;
            }
            if starts_tag(rest) {
                let child = self.element(depth + 1)?;
                element.children.push(child);
                continue;
            }
            self.text(&mut element.text);
        }
    }

    /// Consume character data up to the next markup start. A `<` that cannot
    /// begin markup is kept as a literal character.
    fn text(&mut self, out: &mut String) {
        let rest = self.rest();
        let mut end = 0;
        while end < rest.len() {
            match rest[end..].find('<') {
                Some(offset) => {
                    let at = end + offset;
                    let candidate = &rest[at..];
                    // Markup at the very start was already ruled out by the caller.
                    if at > 0
                        && (candidate.starts_with("</")
                            || candidate.starts_with("<!")
                            || starts_tag(candidate))
                    {
                        end = at;
                        break;
                    }
                    end = at + 1;
                }
                None => end = rest.len(),
            }
        }
        out.push_str(&decode_entities(&rest[..end]));
        self.pos += end;
    }

    fn name(&mut self) -> Option<String> {
        let rest = self.rest();
        let first = rest.chars().next()?;
        if !is_name_start(first) {
            return None;
        }
        let len = rest
            .find(|ch: char| !is_name_char(ch))
            .unwrap_or(rest.len());
        self.pos += len;
        Some(rest[..len].to_string())
    }

    /// Skip attributes through the end of the opening tag. Returns true for `/>`.
    fn skip_attributes(&mut self, tag: &str) -> Result<bool, MarkupError> {
        let mut quote: Option<char> = None;
        for (offset, ch) in self.rest().char_indices() {
            match (quote, ch) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '"' | '\'') => quote = Some(ch),
                (None, '>') => {
                    let self_closing = self.rest()[..offset].trim_end().ends_with('/');
                    self.pos += offset + 1;
                    return Ok(self_closing);
                }
                (None, '<') => return Err(MarkupError::MalformedTag(self.pos + offset)),
                (None, _) => {}
            }
        }
        Err(MarkupError::UnexpectedEof(tag.to_string()))
    }
}

fn starts_tag(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('<') && chars.next().is_some_and(is_name_start)
}

fn is_name_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == ':'
}

fn is_name_char(ch: char) -> bool {
    ch.is_alphanumeric() || matches!(ch, '_' | ':' | '-' | '.')
}

/// Decode the five named entities and numeric references. Anything else that
/// starts with `&` is kept as written.
fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        match tail.find(';').and_then(|semi| {
            decode_entity(&tail[1..semi]).map(|decoded| (decoded, semi))
        }) {
            Some((decoded, semi)) => {
                out.push(decoded);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}
