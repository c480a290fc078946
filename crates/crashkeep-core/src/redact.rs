//! Secret scrubbing for fault text.
//!
//! Panic messages and error chains regularly carry connection strings and
//! tokens. When `dispatch.redact_secrets` is on, the record builder passes the
//! description, causes and stack trace through a [`Redactor`] before writing.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Replacement text for a scrubbed secret.
pub const REDACTED: &str = "[REDACTED]";

struct SecretRule {
    id: &'static str,
    pattern: &'static LazyLock<Regex>,
    /// Capture group holding the secret; group 0 when the whole match is secret.
    group: usize,
}

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(?:password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|auth)["']?\s*[=:]\s*["']?([^\s"'&,;]{4,})"#,
    )
    .unwrap()
});
static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+([A-Za-z0-9._~+/=-]{8,})").unwrap());
static URL_USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z][a-zA-Z0-9+.-]*://[^/\s:@]+:([^/\s@]+)@").unwrap());
static PREFIXED_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk-[A-Za-z0-9]{20,}|gh[pousr]_[A-Za-z0-9]{30,}|AKIA[0-9A-Z]{16}|xox[baprs]-[A-Za-z0-9-]{10,})")
        .unwrap()
});

static RULES: &[SecretRule] = &[
    SecretRule {
        id: "prefixed-key",
        pattern: &PREFIXED_KEY,
        group: 0,
    },
    SecretRule {
        id: "url-userinfo",
        pattern: &URL_USERINFO,
        group: 1,
    },
    SecretRule {
        id: "bearer",
        pattern: &BEARER,
        group: 1,
    },
    SecretRule {
        id: "key-value",
        pattern: &KEY_VALUE,
        group: 1,
    },
];

/// Regex-based secret redactor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Redactor;

impl Redactor {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Replace every secret-looking token with [`REDACTED`].
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.redact_cow(text).into_owned()
    }

    /// Like [`redact`](Self::redact) but borrows when nothing matched.
    #[must_use]
    pub fn redact_cow<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(text);
        for rule in RULES {
            if !rule.pattern.is_match(&current) {
                continue;
            }
            tracing::trace!(rule = rule.id, "redacting secret");
            current = Cow::Owned(replace_group(rule, &current));
        }
        current
    }
}

fn replace_group(rule: &SecretRule, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in rule.pattern.captures_iter(text) {
        let Some(secret) = caps.get(rule.group) else {
            continue;
        };
        out.push_str(&text[last..secret.start()]);
        out.push_str(REDACTED);
        last = secret.end();
    }
    out.push_str(&text[last..]);
    out
}
