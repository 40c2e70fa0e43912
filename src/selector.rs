//! A small CSS selector engine.
//!
//! Supports comma-separated groups of compound steps (`tag`, `*`, `#id`,
//! `.class`, `[attr]`, `[attr=value]`) joined by descendant (whitespace) or
//! child (`>`) combinators. Tag names compare case-insensitively, as in HTML.

use std::fmt;
use std::str::FromStr;

use crate::dom::{Dom, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("unsupported selector: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrCondition {
    Exists { key: String },
    Eq { key: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Step {
    tag: Option<String>,
    universal: bool,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Part {
    step: Step,
    // Relation to the part on the left.
    combinator: Option<Combinator>,
}

/// A parsed selector list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    groups: Vec<Vec<Part>>,
}

impl Selector {
    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return Err(SelectorError::Empty);
        }

        let groups = split_groups(trimmed)?
            .iter()
            .map(|group| parse_chain(group))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: trimmed.to_string(),
            groups,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `node` matches any group of this selector.
    pub fn matches<D: Dom + ?Sized>(&self, dom: &D, node: NodeId) -> bool {
        if !dom.is_element(node) {
            return false;
        }
        self.groups
            .iter()
            .any(|parts| matches_chain(dom, node, parts))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn matches_chain<D: Dom + ?Sized>(dom: &D, node: NodeId, parts: &[Part]) -> bool {
    let Some((last, rest)) = parts.split_last() else {
        return false;
    };
    if !matches_step(dom, node, &last.step) {
        return false;
    }
    match last.combinator {
        None => rest.is_empty(),
        Some(Combinator::Child) => dom
            .parent_element(node)
            .is_some_and(|parent| matches_chain(dom, parent, rest)),
        Some(Combinator::Descendant) => {
            // Backtracks over every ancestor so `A B > C` finds any valid A.
            let mut cursor = dom.parent_element(node);
            while let Some(ancestor) = cursor {
                if matches_chain(dom, ancestor, rest) {
                    return true;
                }
                cursor = dom.parent_element(ancestor);
            }
            false
        }
    }
}

fn matches_step<D: Dom + ?Sized>(dom: &D, node: NodeId, step: &Step) -> bool {
    if let Some(tag) = &step.tag {
        match dom.tag_name(node) {
            Some(name) if name.eq_ignore_ascii_case(tag) => {}
            _ => return false,
        }
    }

    if let Some(id) = &step.id {
        if dom.attribute(node, "id") != Some(id.as_str()) {
            return false;
        }
    }

    if !step.classes.is_empty() {
        let class_attr = dom.attribute(node, "class").unwrap_or("");
        let has_all = step
            .classes
            .iter()
            .all(|wanted| class_attr.split_whitespace().any(|c| c == wanted));
        if !has_all {
            return false;
        }
    }

    step.attrs.iter().all(|cond| match cond {
        AttrCondition::Exists { key } => dom.attribute(node, key).is_some(),
        AttrCondition::Eq { key, value } => dom.attribute(node, key) == Some(value.as_str()),
    })
}

fn split_groups(selector: &str) -> Result<Vec<String>, SelectorError> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;

    for ch in selector.chars() {
        match ch {
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth == 0 {
                    return Err(SelectorError::Unsupported(selector.into()));
                }
                bracket_depth -= 1;
                current.push(ch);
            }
            ',' if bracket_depth == 0 => {
                let trimmed = current.trim();
                if trimmed.is_empty() {
                    return Err(SelectorError::Unsupported(selector.into()));
                }
                groups.push(trimmed.to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if bracket_depth != 0 {
        return Err(SelectorError::Unsupported(selector.into()));
    }
    let trimmed = current.trim();
    if trimmed.is_empty() {
        return Err(SelectorError::Unsupported(selector.into()));
    }
    groups.push(trimmed.to_string());
    Ok(groups)
}

fn tokenize(selector: &str) -> Result<Vec<String>, SelectorError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;

    let flush = |current: &mut String, tokens: &mut Vec<String>| {
        if !current.trim().is_empty() {
            tokens.push(current.trim().to_string());
        }
        current.clear();
    };

    for ch in selector.chars() {
        match ch {
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                bracket_depth = bracket_depth.saturating_sub(1);
                current.push(ch);
            }
            '>' if bracket_depth == 0 => {
                flush(&mut current, &mut tokens);
                tokens.push(">".to_string());
            }
            '+' | '~' if bracket_depth == 0 => {
                return Err(SelectorError::Unsupported(selector.into()));
            }
            c if c.is_ascii_whitespace() && bracket_depth == 0 => {
                flush(&mut current, &mut tokens);
            }
            _ => current.push(ch),
        }
    }
    flush(&mut current, &mut tokens);
    Ok(tokens)
}

fn parse_chain(selector: &str) -> Result<Vec<Part>, SelectorError> {
    let mut parts: Vec<Part> = Vec::new();
    let mut pending: Option<Combinator> = None;

    for token in tokenize(selector)? {
        if token == ">" {
            if pending.is_some() || parts.is_empty() {
                return Err(SelectorError::Unsupported(selector.into()));
            }
            pending = Some(Combinator::Child);
            continue;
        }

        let step = parse_step(&token)?;
        let combinator = if parts.is_empty() {
            None
        } else {
            Some(pending.take().unwrap_or(Combinator::Descendant))
        };
        parts.push(Part { step, combinator });
    }

    if parts.is_empty() || pending.is_some() {
        return Err(SelectorError::Unsupported(selector.into()));
    }
    Ok(parts)
}

fn parse_step(part: &str) -> Result<Step, SelectorError> {
    let unsupported = || SelectorError::Unsupported(part.into());
    let bytes = part.as_bytes();
    let mut i = 0usize;
    let mut step = Step::default();

    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if step.universal || step.tag.is_some() {
                    return Err(unsupported());
                }
                step.universal = true;
                i += 1;
            }
            b'#' => {
                let (id, next) = parse_ident(part, i + 1).ok_or_else(unsupported)?;
                if step.id.replace(id).is_some() {
                    return Err(unsupported());
                }
                i = next;
            }
            b'.' => {
                let (class_name, next) = parse_ident(part, i + 1).ok_or_else(unsupported)?;
                step.classes.push(class_name);
                i = next;
            }
            b'[' => {
                let close = part[i..].find(']').ok_or_else(unsupported)? + i;
                step.attrs.push(parse_attr(&part[i + 1..close]).ok_or_else(unsupported)?);
                i = close + 1;
            }
            _ => {
                if step.tag.is_some()
                    || step.universal
                    || step.id.is_some()
                    || !step.classes.is_empty()
                    || !step.attrs.is_empty()
                {
                    return Err(unsupported());
                }
                let (tag, next) = parse_ident(part, i).ok_or_else(unsupported)?;
                step.tag = Some(tag);
                i = next;
            }
        }
    }

    Ok(step)
}

fn parse_ident(src: &str, start: usize) -> Option<(String, usize)> {
    let end = src[start..]
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '-' || *c == '_'))
        .map_or(src.len(), |(offset, _)| start + offset);
    if end == start {
        None
    } else {
        Some((src[start..end].to_string(), end))
    }
}

fn parse_attr(inner: &str) -> Option<AttrCondition> {
    let inner = inner.trim();
    match inner.split_once('=') {
        None => {
            let (key, rest) = parse_ident(inner, 0)?;
            (rest == inner.len()).then_some(AttrCondition::Exists { key })
        }
        Some((key, value)) => {
            let key = key.trim();
            let (parsed_key, rest) = parse_ident(key, 0)?;
            if rest != key.len() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some(AttrCondition::Eq {
                key: parsed_key,
                value: value.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Document;

    fn calendar_page() -> (Document, NodeId, NodeId) {
        let mut doc = Document::new("https://example.test/booking");
        let block = doc.create_element("div");
        doc.set_attribute(block, "class", "calander-display-block wide");
        let inner = doc.create_element("div");
        let calendar = doc.create_element("mat-calendar");
        doc.set_attribute(calendar, "id", "cal");
        doc.set_attribute(calendar, "data-state", "open");
        doc.append_child(doc.body(), block).unwrap();
        doc.append_child(block, inner).unwrap();
        doc.append_child(inner, calendar).unwrap();
        (doc, block, calendar)
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(Selector::parse("  "), Err(SelectorError::Empty));
        assert!(Selector::parse("div >").is_err());
        assert!(Selector::parse("> div").is_err());
        assert!(Selector::parse("div,").is_err());
        assert!(Selector::parse("div + p").is_err());
        assert!(Selector::parse("[data-x").is_err());
        assert!(Selector::parse(".").is_err());
        assert!(Selector::parse(".cal div").is_ok());
    }

    #[test]
    fn test_child_chain_matches_case_insensitively() {
        let (doc, _, calendar) = calendar_page();
        let selector = Selector::parse("DIV.calander-display-block > DIV > MAT-CALENDAR").unwrap();
        assert!(selector.matches(&doc, calendar));

        let wrong = Selector::parse("DIV.calander-display-block > MAT-CALENDAR").unwrap();
        assert!(!wrong.matches(&doc, calendar));
    }

    #[test]
    fn test_descendant_id_attr_and_groups() {
        let (doc, block, calendar) = calendar_page();
        assert!(Selector::parse("div mat-calendar").unwrap().matches(&doc, calendar));
        assert!(Selector::parse("#cal").unwrap().matches(&doc, calendar));
        assert!(Selector::parse("[data-state]").unwrap().matches(&doc, calendar));
        assert!(Selector::parse("[data-state=\"open\"]").unwrap().matches(&doc, calendar));
        assert!(!Selector::parse("[data-state=closed]").unwrap().matches(&doc, calendar));
        assert!(Selector::parse("p, .wide").unwrap().matches(&doc, block));
        assert!(!Selector::parse(".wide.missing").unwrap().matches(&doc, block));
        assert!(Selector::parse("*").unwrap().matches(&doc, block));
    }
}
