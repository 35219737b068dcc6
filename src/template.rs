//! Key templating.
//!
//! Redis keys in configuration may carry `{{field}}` placeholders that are
//! filled in from the metadata of the message being evaluated, e.g.
//! `rep:{{from_domain}}`. Expansion is a single-pass variable substitution,
//! not an expression language.
//!
//! Field values are pure derivations from [`TaskMeta`] (domain part of the
//! sender, simplified eSLD, ...). Each derivation runs at most once per
//! [`TemplateContext`]: the context memoizes the result on first access,
//! including absent results. Absent fields render as the empty string and
//! never fail expansion.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

/// Metadata of the message that triggered a request.
///
/// Everything is optional; a task-less request uses an empty context where
/// every placeholder renders empty.
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    /// Envelope sender address.
    pub from: Option<String>,
    /// Principal (first envelope) recipient address.
    pub rcpt: Option<String>,
    /// Connecting client address.
    pub ip: Option<IpAddr>,
    /// HELO/EHLO name.
    pub helo: Option<String>,
}

type Derive = fn(&TaskMeta) -> Option<String>;

fn domain_of(addr: &str) -> Option<String> {
    let (_, domain) = addr.rsplit_once('@')?;
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_ascii_lowercase())
    }
}

/// Simplified effective second-level domain: the last two labels.
///
/// A real public-suffix lookup lives with the host application; reputation
/// keys only need a stable coarsening of the domain.
fn esld_of(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        domain.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// Field table: name (lowercase) to derivation. Data, not control flow.
static FIELDS: &[(&str, Derive)] = &[
    ("from", |t| t.from.clone()),
    ("from_domain", |t| t.from.as_deref().and_then(domain_of)),
    ("esld_from_domain", |t| {
        t.from.as_deref().and_then(domain_of).map(|d| esld_of(&d))
    }),
    ("rcpt", |t| t.rcpt.clone()),
    ("rcpt_domain", |t| t.rcpt.as_deref().and_then(domain_of)),
    ("esld_rcpt_domain", |t| {
        t.rcpt.as_deref().and_then(domain_of).map(|d| esld_of(&d))
    }),
    ("ip", |t| t.ip.map(|ip| ip.to_string())),
    ("helo", |t| t.helo.clone()),
];

/// Lazily-computed, memoized view of a task's template fields.
pub struct TemplateContext<'a> {
    task: Option<&'a TaskMeta>,
    memo: HashMap<String, Option<String>>,
}

impl<'a> TemplateContext<'a> {
    pub fn for_task(task: &'a TaskMeta) -> TemplateContext<'a> {
        TemplateContext {
            task: Some(task),
            memo: HashMap::new(),
        }
    }

    /// Context with no task behind it; every field is absent.
    pub fn empty() -> TemplateContext<'static> {
        TemplateContext {
            task: None,
            memo: HashMap::new(),
        }
    }

    /// Resolve a field case-insensitively, computing and caching it on
    /// first access. Unknown fields resolve to absent.
    pub fn lookup(&mut self, field: &str) -> Option<String> {
        let name = field.trim().to_ascii_lowercase();
        if let Some(cached) = self.memo.get(&name) {
            return cached.clone();
        }
        let value = match FIELDS.iter().find(|(n, _)| *n == name) {
            Some((_, derive)) => self.task.and_then(derive),
            None => {
                debug!(field = %name, "unknown template field");
                None
            }
        };
        self.memo.insert(name, value.clone());
        value
    }

    #[cfg(test)]
    fn memoized(&self) -> usize {
        self.memo.len()
    }
}

/// Expand every `{{field}}` placeholder in `input`.
///
/// Absent fields render empty. An unterminated `{{` is copied through
/// literally. A string without placeholders is returned unchanged.
pub fn expand(input: &str, ctx: &mut TemplateContext<'_>) -> String {
    if !input.contains("{{") {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                if let Some(value) = ctx.lookup(&after[..end]) {
                    out.push_str(&value);
                }
                rest = &after[end + 2..];
            }
            None => {
                // No closing braces; keep the tail as-is.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
