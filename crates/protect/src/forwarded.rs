//! Detection of forwarded-message blocks quoted inside a body part.
//!
//! Mail clients quote a forwarded message between a start marker and a
//! client-specific end marker. Lines inside such a block are copied to the
//! output untouched, so the quoted mail stays exactly as the user saw it.
//! Markers live in [`FORWARD_RULES`]; supporting another client means
//! adding rows to that table.

use crate::ContentType;

/// What a matching marker does to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorRole {
    Start,
    End,
}

/// How a marker is recognized on a (decoded) line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Contains(&'static str),
    BlankLine,
}

impl Marker {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Marker::Contains(needle) => line.contains(needle),
            Marker::BlankLine => line.trim().is_empty(),
        }
    }
}

/// A single row of the marker table, `content_type` of `None` applies to
/// every part.
#[derive(Debug, Clone, Copy)]
pub struct ForwardRule {
    pub content_type: Option<ContentType>,
    pub marker: Marker,
    pub role: DetectorRole,
}

pub const FORWARD_RULES: &[ForwardRule] = &[
    ForwardRule {
        content_type: None,
        marker: Marker::Contains("---------- Forwarded message ---------"),
        role: DetectorRole::Start,
    },
    ForwardRule {
        content_type: None,
        marker: Marker::Contains("Forwarded message"),
        role: DetectorRole::Start,
    },
    ForwardRule {
        content_type: Some(ContentType::TextHtml),
        marker: Marker::Contains(r#"<div dir="ltr" class="gmail_attr">"#),
        role: DetectorRole::Start,
    },
    ForwardRule {
        content_type: Some(ContentType::TextHtml),
        marker: Marker::Contains("<u></u>"),
        role: DetectorRole::End,
    },
    ForwardRule {
        content_type: Some(ContentType::TextHtml),
        marker: Marker::Contains("</div></div>"),
        role: DetectorRole::End,
    },
    ForwardRule {
        content_type: Some(ContentType::TextHtml),
        marker: Marker::Contains("<br><br>"),
        role: DetectorRole::End,
    },
    ForwardRule {
        content_type: Some(ContentType::TextPlain),
        marker: Marker::BlankLine,
        role: DetectorRole::End,
    },
    ForwardRule {
        content_type: Some(ContentType::Default),
        marker: Marker::BlankLine,
        role: DetectorRole::End,
    },
];

/// Two-state detector fed one decoded line at a time.
#[derive(Debug, Clone)]
pub struct ForwardedSectionDetector {
    content_type: ContentType,
    rules: &'static [ForwardRule],
    forwarded: bool,
}

impl ForwardedSectionDetector {
    pub fn new(content_type: ContentType) -> Self {
        Self::with_rules(content_type, FORWARD_RULES)
    }

    pub fn with_rules(content_type: ContentType, rules: &'static [ForwardRule]) -> Self {
        Self {
            content_type,
            rules,
            forwarded: false,
        }
    }

    /// Feeds a line and returns whether it belongs to a forwarded block.
    ///
    /// Both the start and the end marker lines are part of the block. The
    /// end marker is only looked for on lines after the start marker.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.forwarded {
            if self.matches(line, DetectorRole::End) {
                self.forwarded = false;
            }
            return true;
        }
        if self.matches(line, DetectorRole::Start) {
            self.forwarded = true;
            return true;
        }
        false
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    pub fn reset(&mut self) {
        self.forwarded = false;
    }

    fn matches(&self, line: &str, role: DetectorRole) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.role == role)
            .filter(|rule| {
                rule.content_type
                    .is_none_or(|content_type| content_type == self.content_type)
            })
            .any(|rule| rule.marker.matches(line))
    }
}
