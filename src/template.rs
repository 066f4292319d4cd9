//! Generation directory naming
//!
//! Each cycle names its generation directories with a printf-like template
//! such as `hour_%02d_%s` or `week_%d_%s`: one integer placeholder for the
//! generation index followed by one string placeholder for the creation label
//! of the snapshot the generation was cloned from.
//!
//! The index width is part of the template and must survive round trips so
//! that `ls` lists generations in order (`hour_02_...` before `hour_10_...`).
//!
//! Supported placeholders are `%d`, `%0Nd` (zero-padded to `N` digits), `%s`
//! and the literal `%%`. The index must come first and the two placeholders
//! must be separated by literal text, otherwise names would be ambiguous.

use crate::error::{HardsnapError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A parsed generation directory template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DirTemplate {
    source: String,
    head: String,
    width: usize,
    middle: String,
    tail: String,
}

impl DirTemplate {
    /// Parse a template string
    pub fn parse(template: &str) -> Result<Self> {
        let invalid = |reason: &str| HardsnapError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        // Literal text before the index, between index and label, after label
        let mut segments = Vec::with_capacity(3);
        let mut literal = String::new();
        let mut width = None;
        let mut seen_label = false;
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }

            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() {
                    digits.push(d);
                    chars.next();
                } else {
                    break;
                }
            }

            match chars.next() {
                Some('%') if digits.is_empty() => literal.push('%'),
                Some('d') => {
                    if width.is_some() {
                        return Err(invalid("more than one index placeholder"));
                    }
                    if seen_label {
                        return Err(invalid("index placeholder must precede the label"));
                    }
                    let w = if digits.is_empty() {
                        0
                    } else if digits.starts_with('0') {
                        digits[1..].parse::<usize>().map_err(|_| invalid("bad index width"))?
                    } else {
                        return Err(invalid("only zero padding is supported for the index"));
                    };
                    width = Some(w);
                    segments.push(std::mem::take(&mut literal));
                }
                Some('s') if digits.is_empty() => {
                    if seen_label {
                        return Err(invalid("more than one label placeholder"));
                    }
                    if width.is_none() {
                        return Err(invalid("index placeholder must precede the label"));
                    }
                    seen_label = true;
                    segments.push(std::mem::take(&mut literal));
                }
                _ => return Err(invalid("unsupported placeholder")),
            }
        }

        let width = width.ok_or_else(|| invalid("missing index placeholder"))?;
        if !seen_label {
            return Err(invalid("missing label placeholder"));
        }

        let tail = literal;
        let middle = segments.pop().unwrap_or_default();
        let head = segments.pop().unwrap_or_default();

        if middle.is_empty() {
            return Err(invalid("index and label must be separated"));
        }
        if head.contains('/') || middle.contains('/') || tail.contains('/') {
            return Err(invalid("template must name a single directory"));
        }

        Ok(Self {
            source: template.to_string(),
            head,
            width,
            middle,
            tail,
        })
    }

    /// The template string as configured
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render the directory name for a generation
    pub fn render(&self, index: usize, label: &str) -> String {
        format!(
            "{}{:0width$}{}{}{}",
            self.head,
            index,
            self.middle,
            label,
            self.tail,
            width = self.width
        )
    }

    /// Split a directory name into `(index, label)` if it was produced by this template
    pub fn parse_name<'a>(&self, name: &'a str) -> Option<(usize, &'a str)> {
        let rest = name.strip_prefix(self.head.as_str())?;
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 || digits < self.width {
            return None;
        }
        let index = rest[..digits].parse::<usize>().ok()?;
        let label = rest[digits..]
            .strip_prefix(self.middle.as_str())?
            .strip_suffix(self.tail.as_str())?;
        if label.is_empty() {
            return None;
        }
        // Reject names this template would never have rendered, e.g. "hour_1_x" for "%02d"
        if self.render(index, label) != name {
            return None;
        }
        Some((index, label))
    }
}

impl fmt::Display for DirTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for DirTemplate {
    type Error = HardsnapError;

    fn try_from(value: String) -> Result<Self> {
        DirTemplate::parse(&value)
    }
}

impl From<DirTemplate> for String {
    fn from(value: DirTemplate) -> Self {
        value.source
    }
}
