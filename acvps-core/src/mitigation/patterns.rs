//! PII patterns and plain-text redaction.
//!
//! Detection is regex-based and therefore approximate: it catches the common
//! US shapes of SSNs, payment cards, emails and phone numbers, and will both
//! miss unusual formats and flag some harmless digit runs.

use regex::{NoExpand, Regex};
use std::borrow::Cow;
use std::sync::LazyLock;

// SAFETY: .expect() on compile-time literal patterns, covered by tests.
static SSN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("BUG: SSN regex is invalid")
});

/// 13 to 19 digits, each optionally followed by one space or dash.
static CREDIT_CARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("BUG: credit card regex is invalid")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("BUG: email regex is invalid")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").expect("BUG: phone regex is invalid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiKind {
    Ssn,
    CreditCard,
    Email,
    Phone,
}

impl PiiKind {
    /// Application order. SSN and card shapes go first so the shorter phone
    /// pattern cannot split them.
    pub const ALL: [PiiKind; 4] = [
        PiiKind::Ssn,
        PiiKind::CreditCard,
        PiiKind::Email,
        PiiKind::Phone,
    ];

    pub fn replacement(self) -> &'static str {
        match self {
            PiiKind::Ssn => "[REDACTED-SSN]",
            PiiKind::CreditCard => "[REDACTED-CC]",
            PiiKind::Email => "[REDACTED-EMAIL]",
            PiiKind::Phone => "[REDACTED-PHONE]",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PiiKind::Ssn => "ssn",
            PiiKind::CreditCard => "credit_card",
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
        }
    }

    fn regex(self) -> &'static Regex {
        match self {
            PiiKind::Ssn => &SSN,
            PiiKind::CreditCard => &CREDIT_CARD,
            PiiKind::Email => &EMAIL,
            PiiKind::Phone => &PHONE,
        }
    }
}

/// Matches replaced per PII class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PiiCounts {
    pub ssn: usize,
    pub credit_card: usize,
    pub email: usize,
    pub phone: usize,
}

impl PiiCounts {
    pub fn get(&self, kind: PiiKind) -> usize {
        match kind {
            PiiKind::Ssn => self.ssn,
            PiiKind::CreditCard => self.credit_card,
            PiiKind::Email => self.email,
            PiiKind::Phone => self.phone,
        }
    }

    fn add(&mut self, kind: PiiKind, n: usize) {
        match kind {
            PiiKind::Ssn => self.ssn += n,
            PiiKind::CreditCard => self.credit_card += n,
            PiiKind::Email => self.email += n,
            PiiKind::Phone => self.phone += n,
        }
    }

    pub fn total(&self) -> usize {
        self.ssn + self.credit_card + self.email + self.phone
    }
}

/// Replace every PII match in `text`. Returns `None` when nothing matched.
///
/// Passes repeat until the text is stable, so the result is a fixed point
/// and redacting it again changes nothing. Each replacing pass removes at
/// least one digit or `@`, which bounds the loop.
pub fn redact_text(text: &str, counts: &mut PiiCounts) -> Option<String> {
    let mut current: Cow<'_, str> = Cow::Borrowed(text);
    loop {
        let mut changed = false;
        for kind in PiiKind::ALL {
            let regex = kind.regex();
            let hits = regex.find_iter(&current).count();
            if hits == 0 {
                continue;
            }
            let replaced = regex
                .replace_all(&current, NoExpand(kind.replacement()))
                .into_owned();
            current = Cow::Owned(replaced);
            counts.add(kind, hits);
            changed = true;
        }
        if !changed {
            break;
        }
    }

    match current {
        Cow::Borrowed(_) => None,
        Cow::Owned(redacted) => Some(redacted),
    }
}
