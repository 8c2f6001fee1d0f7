//! Ticket references and `tk show` output parsing.
//!
//! `tk show {id}` prints a YAML frontmatter block between `---` lines followed
//! by a markdown body whose first `# ` heading is the title:
//!
//! ```text
//! ---
//! id: pt-abc123
//! status: open
//! deps: [pt-x]
//! tags: [component:api, backend]
//! ---
//! # Fix the thing
//! ```
//!
//! Parsing never fails: anything unreadable is simply absent.

use serde::Deserialize;
use serde_yaml::Value as YamlValue;

/// A ticket as seen by one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TicketRef {
    pub id: String,
    pub title: Option<String>,
    /// Ordered, without duplicates.
    pub tags: Vec<String>,
}

impl TicketRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = dedup(tags.into_iter().map(Into::into));
        self
    }

    /// Tags carrying `prefix`, in ticket order.
    pub fn component_tags(&self, prefix: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }
}

/// True when `id` can name a file under the logs and worktrees directories.
///
/// Rejects empty ids, `.` and `..`, and anything carrying a path separator
/// or NUL.
pub fn is_valid_ticket_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

/// Everything extracted from one `tk show` document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TicketDocument {
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub status: Option<String>,
    pub deps: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Frontmatter {
    tags: Option<YamlValue>,
    status: Option<String>,
    deps: Option<YamlValue>,
}

/// Parses a `tk show` document.
pub fn parse_show_output(text: &str) -> TicketDocument {
    let (frontmatter, body) = split_frontmatter(text);

    let mut doc = TicketDocument {
        title: find_title(body),
        ..TicketDocument::default()
    };

    let Some(block) = frontmatter else {
        return doc;
    };

    match serde_yaml::from_str::<Frontmatter>(block) {
        Ok(fm) => {
            doc.tags = fm.tags.as_ref().map(yaml_list).unwrap_or_default();
            doc.status = fm.status.map(|s| s.trim().to_string());
            doc.deps = fm.deps.as_ref().map(yaml_list).unwrap_or_default();
        }
        Err(e) => {
            tracing::debug!("frontmatter is not valid YAML ({e}); scanning lines");
            doc.tags = scan_list_field(block, "tags");
            doc.status = scan_scalar_field(block, "status");
            doc.deps = scan_list_field(block, "deps");
        }
    }
    doc
}

/// Splits a document into its frontmatter block (without delimiters) and
/// the remaining body.
pub fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start_matches(['\n', '\r']);
    let Some(rest) = trimmed
        .strip_prefix("---\n")
        .or_else(|| trimmed.strip_prefix("---\r\n"))
    else {
        return (None, text);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let block = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(block), body);
        }
        offset += line.len();
    }
    // Unterminated block: treat the whole thing as body
    (None, text)
}

/// First `# ` heading in `body`.
pub fn find_title(body: &str) -> Option<String> {
    body.lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn yaml_list(value: &YamlValue) -> Vec<String> {
    match value {
        YamlValue::Sequence(items) => dedup(items.iter().filter_map(yaml_scalar)),
        YamlValue::String(s) => parse_inline_list(s),
        YamlValue::Null => Vec::new(),
        other => dedup(yaml_scalar(other)),
    }
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses `[a, b]`, `a, b` or `a` into an ordered list.
fn parse_inline_list(raw: &str) -> Vec<String> {
    let inner = raw.trim();
    let inner = inner
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(inner);
    dedup(
        inner
            .split(',')
            .map(|t| t.trim().trim_matches(['"', '\'']).trim().to_string())
            .filter(|t| !t.is_empty()),
    )
}

fn scan_scalar_field(block: &str, field: &str) -> Option<String> {
    let prefix = format!("{field}:");
    block.lines().find_map(|line| {
        line.trim_start()
            .strip_prefix(&prefix)
            .map(|v| v.trim().trim_matches(['"', '\'']).to_string())
            .filter(|v| !v.is_empty())
    })
}

fn scan_list_field(block: &str, field: &str) -> Vec<String> {
    let prefix = format!("{field}:");
    let mut lines = block.lines();
    while let Some(line) = lines.next() {
        let Some(value) = line.trim_start().strip_prefix(&prefix) else {
            continue;
        };
        if !value.trim().is_empty() {
            return parse_inline_list(value);
        }
        // Block list form: following `- item` lines
        let items = lines
            .by_ref()
            .map_while(|l| l.trim_start().strip_prefix("- ").map(str::to_string))
            .map(|t| t.trim().trim_matches(['"', '\'']).to_string())
            .filter(|t| !t.is_empty());
        return dedup(items);
    }
    Vec::new()
}

fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_id_validation() {
        for ok in ["pt-1", "pt-abc123", "ABC-9", "a.b", "..x"] {
            assert!(is_valid_ticket_id(ok), "{ok} rejected");
        }
        for bad in ["", ".", "..", "../x", "a/b", "/etc", "a\\b", "a\0b"] {
            assert!(!is_valid_ticket_id(bad), "{bad:?} accepted");
        }
    }

    const SHOW: &str = "---\nid: pt-abc\nstatus: open\ndeps: [pt-x, pt-y]\ntags: [component:api, backend]\n---\n# Fix the thing\n\nBody text\n# Not the title\n";

    #[test]
    fn test_parse_bracketed_tags_and_title() {
        let doc = parse_show_output(SHOW);
        assert_eq!(doc.tags, vec!["component:api", "backend"]);
        assert_eq!(doc.title.as_deref(), Some("Fix the thing"));
        assert_eq!(doc.status.as_deref(), Some("open"));
        assert_eq!(doc.deps, vec!["pt-x", "pt-y"]);
    }

    #[test]
    fn test_parse_bare_comma_tags() {
        let doc = parse_show_output("---\ntags: component:cli, docs\n---\n# T\n");
        assert_eq!(doc.tags, vec!["component:cli", "docs"]);
    }

    #[test]
    fn test_parse_block_list_tags() {
        let doc = parse_show_output("---\ntags:\n  - component:api\n  - backend\n---\n# T\n");
        assert_eq!(doc.tags, vec!["component:api", "backend"]);
    }

    #[test]
    fn test_fallback_line_scan_on_invalid_yaml() {
        // Unbalanced quote makes the block invalid YAML
        let text = "---\ntitle: \"broken\nstatus: in_progress\ntags: [component:api, ops]\n---\n# Title\n";
        let doc = parse_show_output(text);
        assert_eq!(doc.tags, vec!["component:api", "ops"]);
        assert_eq!(doc.status.as_deref(), Some("in_progress"));
    }

    #[test]
    fn test_heading_inside_frontmatter_is_not_title() {
        let doc = parse_show_output("---\n# comment\ntags: []\n---\nno heading here\n");
        assert_eq!(doc.title, None);
        assert!(doc.tags.is_empty());
    }

    #[test]
    fn test_no_frontmatter() {
        let doc = parse_show_output("# Just a title\nbody\n");
        assert_eq!(doc.title.as_deref(), Some("Just a title"));
        assert!(doc.tags.is_empty());
        assert_eq!(doc.status, None);
    }

    #[test]
    fn test_duplicate_tags_removed_in_order() {
        let doc = parse_show_output("---\ntags: [a, b, a, c]\n---\n");
        assert_eq!(doc.tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_component_tags() {
        let t = TicketRef::new("pt-4").with_tags(["component:cli", "x", "component:docs"]);
        assert_eq!(t.component_tags("component:"), vec!["component:cli", "component:docs"]);
        assert!(TicketRef::new("pt-9").component_tags("component:").is_empty());
    }
}
