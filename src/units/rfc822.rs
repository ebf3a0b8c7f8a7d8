//! rfc822-style record parsing
//!
//! Unit definitions and resource job output share one format: `key: value`
//! lines grouped into records separated by blank lines. Values continue on
//! lines starting with whitespace; a continuation line holding only `.`
//! stands for an empty line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::common::{Error, Result};

/// Where a record came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub source: String,
    pub line_start: usize,
    pub line_end: usize,
}

impl Origin {
    pub fn new(source: impl Into<String>, line_start: usize, line_end: usize) -> Self {
        Self {
            source: source.into(),
            line_start,
            line_end,
        }
    }

    /// Origin for units created in memory rather than read from a file
    pub fn synthetic(source: impl Into<String>) -> Self {
        Self::new(source, 0, 0)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line_start == 0 {
            write!(f, "{}", self.source)
        } else {
            write!(f, "{}:{}-{}", self.source, self.line_start, self.line_end)
        }
    }
}

/// What to do when a key repeats within one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKeys {
    /// Unit definitions: a repeated key is a syntax error
    Reject,
    /// Resource output: the last value wins
    Overwrite,
}

/// A single parsed record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fields: BTreeMap<String, String>,
    pub origin: Origin,
}

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Accumulates one `key: value` entry including continuation lines
struct PendingField {
    key: String,
    first: String,
    rest: Vec<String>,
}

impl PendingField {
    fn finish(self) -> (String, String) {
        let value = if self.rest.is_empty() {
            self.first.trim().to_string()
        } else {
            let mut lines = vec![self.first.trim().to_string()];
            lines.extend(dedent(&self.rest));
            lines.join("\n").trim_matches('\n').trim_end().to_string()
        };
        (self.key, value)
    }
}

struct Builder<'a> {
    source: &'a str,
    duplicates: DuplicateKeys,
    fields: BTreeMap<String, String>,
    pending: Option<PendingField>,
    line_start: usize,
    line_end: usize,
    records: Vec<Record>,
}

impl<'a> Builder<'a> {
    fn commit_field(&mut self) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            let (key, value) = pending.finish();
            if self.duplicates == DuplicateKeys::Reject && self.fields.contains_key(&key) {
                return Err(Error::parse(
                    Origin::new(self.source, self.line_start, self.line_end),
                    format!("duplicate key '{}'", key),
                ));
            }
            self.fields.insert(key, value);
        }
        Ok(())
    }

    fn commit_record(&mut self) -> Result<()> {
        self.commit_field()?;
        if !self.fields.is_empty() {
            self.records.push(Record {
                fields: std::mem::take(&mut self.fields),
                origin: Origin::new(self.source, self.line_start, self.line_end),
            });
        }
        self.line_start = 0;
        Ok(())
    }
}

/// Parse `text` into records
pub fn parse(text: &str, source: &str, duplicates: DuplicateKeys) -> Result<Vec<Record>> {
    let mut builder = Builder {
        source,
        duplicates,
        fields: BTreeMap::new(),
        pending: None,
        line_start: 0,
        line_end: 0,
        records: Vec::new(),
    };

    for (index, line) in text.lines().enumerate() {
        let lineno = index + 1;

        if line.trim().is_empty() {
            builder.commit_record()?;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(pending) = builder.pending.as_mut() else {
                return Err(Error::parse(
                    Origin::new(source, lineno, lineno),
                    "continuation line without a preceding key",
                ));
            };
            let rest = &line[1..];
            if rest.trim() == "." {
                pending.rest.push(String::new());
            } else {
                pending.rest.push(rest.to_string());
            }
            builder.line_end = lineno;
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            return Err(Error::parse(
                Origin::new(source, lineno, lineno),
                format!("expected 'key: value', got '{}'", line.trim()),
            ));
        };
        let key = key.trim();
        // A leading underscore marks translatable fields
        let key = key.strip_prefix('_').unwrap_or(key);
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(Error::parse(
                Origin::new(source, lineno, lineno),
                format!("invalid key '{}'", key),
            ));
        }

        builder.commit_field()?;
        if builder.line_start == 0 {
            builder.line_start = lineno;
        }
        builder.line_end = lineno;
        builder.pending = Some(PendingField {
            key: key.to_string(),
            first: value.to_string(),
            rest: Vec::new(),
        });
    }
    builder.commit_record()?;

    Ok(builder.records)
}

/// Strip the indentation common to all non-empty lines
fn dedent(lines: &[String]) -> Vec<String> {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|l| {
            if l.len() >= indent {
                l[indent..].trim_end().to_string()
            } else {
                l.trim().to_string()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_split_on_blank_lines() {
        let text = "id: a\nplugin: shell\n\n\nid: b\n";
        let records = parse(text, "units.pxu", DuplicateKeys::Reject).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("plugin"), Some("shell"));
        assert_eq!(records[1].origin, Origin::new("units.pxu", 5, 5));
    }

    #[test]
    fn test_multiline_values_are_dedented() {
        let text = "id: a\ncommand:\n  echo one\n  .\n    echo two\nplugin: shell\n";
        let records = parse(text, "u", DuplicateKeys::Reject).unwrap();
        assert_eq!(records[0].get("command"), Some("echo one\n\n  echo two"));
        assert_eq!(records[0].origin.line_end, 6);
    }

    #[test]
    fn test_translatable_prefix_and_comments() {
        let text = "# leading comment\nid: a\n_summary: Check things\n";
        let records = parse(text, "u", DuplicateKeys::Reject).unwrap();
        assert_eq!(records[0].get("summary"), Some("Check things"));
        assert_eq!(records[0].origin.line_start, 2);
    }

    #[test]
    fn test_duplicate_key_policies() {
        let text = "name: a\nname: b\n";
        assert!(matches!(
            parse(text, "u", DuplicateKeys::Reject),
            Err(Error::Parse { .. })
        ));
        let records = parse(text, "u", DuplicateKeys::Overwrite).unwrap();
        assert_eq!(records[0].get("name"), Some("b"));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse(" orphan\n", "u", DuplicateKeys::Reject).is_err());
        assert!(parse("no colon here\n", "u", DuplicateKeys::Reject).is_err());
        assert!(parse(": empty key\n", "u", DuplicateKeys::Reject).is_err());
    }

    #[test]
    fn test_value_keeps_inner_colons() {
        let records = parse("url: http://host:80/x\n", "u", DuplicateKeys::Reject).unwrap();
        assert_eq!(records[0].get("url"), Some("http://host:80/x"));
    }
}
