//! Template units and their expansion into jobs
//!
//! A template names a resource job and holds job fields with placeholders.
//! Each record of the resource's table that passes `template-filter` yields
//! one job, with placeholders replaced by that record's fields. The extra
//! placeholder `__index__` is the 1-based position of the record among those
//! that passed the filter.

use std::collections::{BTreeMap, BTreeSet};

use super::job::{partial_id, JobUnit};
use super::rfc822::{Origin, Record};
use crate::common::{Error, Result};
use crate::resource::eval::evaluate_program;
use crate::resource::expr::{Program, Scope};
use crate::resource::table::{ResourceMap, ResourceRecord, ResourceTable};

/// Placeholder syntax used by a template
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TemplateEngine {
    /// `{name}`, with `{{` and `}}` as literal braces
    #[default]
    Default,
    /// `{{ name }}`
    Jinja2,
}

#[derive(Debug, Clone, PartialEq)]
enum Piece {
    Text(String),
    Param(String),
}

#[derive(Debug, Clone)]
pub struct TemplateUnit {
    /// Qualified template id, used by test plans to select every instance
    pub id: String,
    /// Qualified id of the resource job driving the expansion
    pub resource: String,
    pub filter: Option<Program>,
    pub engine: TemplateEngine,
    /// Job fields with placeholders, `template-*` fields removed
    pub fields: BTreeMap<String, String>,
    pub namespace: Option<String>,
    pub origin: Origin,
}

impl TemplateUnit {
    pub fn from_record(record: &Record, namespace: Option<&str>) -> Result<Self> {
        let origin = record.origin.clone();
        let bad = |message: String| Error::parse(&origin, message);
        let get = |key: &str| record.get(key).map(str::trim).filter(|v| !v.is_empty());

        let raw_id = get("id").ok_or_else(|| bad("template has no 'id' field".into()))?;

        let unit_kind = get("template-unit").unwrap_or("job");
        if unit_kind != "job" {
            return Err(bad(format!(
                "template '{}' instantiates unsupported unit '{}'",
                raw_id, unit_kind
            )));
        }

        let engine = match get("template-engine") {
            None | Some("default") => TemplateEngine::Default,
            Some("jinja2") => TemplateEngine::Jinja2,
            Some(other) => return Err(bad(format!("unknown template engine '{}'", other))),
        };

        let mut scope = Scope::new(namespace);
        if let Some(imports) = get("template-imports") {
            scope = scope.with_imports(imports).map_err(|e| bad(e.to_string()))?;
        }

        let resource_name = get("template-resource")
            .ok_or_else(|| bad(format!("template '{}' has no 'template-resource'", raw_id)))?;
        let resource = scope
            .imports
            .get(resource_name)
            .cloned()
            .unwrap_or_else(|| scope.qualify(resource_name));

        let filter = get("template-filter")
            .map(|text| Program::parse(text, &scope))
            .transpose()
            .map_err(|e| bad(format!("invalid template-filter: {}", e)))?;

        let template_id = match get("template-id") {
            Some(id) => id.to_string(),
            None => slugify_template_id(partial_id(raw_id)),
        };

        let fields: BTreeMap<String, String> = record
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("template-") && k.as_str() != "unit")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let template = Self {
            id: scope.qualify(&template_id),
            resource,
            filter,
            engine,
            fields,
            namespace: namespace.map(str::to_string),
            origin: origin.clone(),
        };

        // Surface malformed placeholders at load time
        for value in template.fields.values() {
            split_pattern(value, engine).map_err(|e| bad(format!("template '{}': {}", raw_id, e)))?;
        }

        Ok(template)
    }

    /// Every placeholder name used by this template
    pub fn placeholders(&self) -> BTreeSet<String> {
        self.fields
            .values()
            .filter_map(|v| split_pattern(v, self.engine).ok())
            .flatten()
            .filter_map(|piece| match piece {
                Piece::Param(name) => Some(name),
                Piece::Text(_) => None,
            })
            .collect()
    }

    /// Whether a resource record passes `template-filter`
    fn accepts(&self, record: &ResourceRecord) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        let mut tables = ResourceMap::new();
        tables.insert(
            self.resource.clone(),
            ResourceTable {
                records: vec![record.clone()],
            },
        );
        match evaluate_program(filter, &tables) {
            Ok(matched) => matched,
            Err(e) => {
                tracing::debug!(template = %self.id, error = %e, "filter failed for record");
                false
            }
        }
    }

    /// Instantiate one job from a record
    pub fn instantiate_one(&self, record: &ResourceRecord, index: usize) -> Result<JobUnit> {
        let mut params = record.clone();
        params.insert("__index__".to_string(), index.to_string());

        let mut fields = BTreeMap::new();
        for (key, pattern) in &self.fields {
            let mut value = String::new();
            for piece in split_pattern(pattern, self.engine).map_err(|e| Error::template(&self.id, e))? {
                match piece {
                    Piece::Text(text) => value.push_str(&text),
                    Piece::Param(name) => {
                        let param = params.get(&name).ok_or_else(|| {
                            Error::template(
                                &self.id,
                                format!(
                                    "field '{}' refers to '{}', which resource record {} does not have",
                                    key, name, index
                                ),
                            )
                        })?;
                        value.push_str(param);
                    }
                }
            }
            fields.insert(key.clone(), value);
        }

        let mut job = JobUnit::from_fields(&fields, self.origin.clone(), self.namespace.as_deref())
            .map_err(|e| Error::template(&self.id, e.to_string()))?;
        job.template_id = Some(self.id.clone());
        job.template_resource = Some(self.resource.clone());
        Ok(job)
    }

    /// Expand the template against the resource table it names
    pub fn expand(&self, table: &ResourceTable) -> Result<Vec<JobUnit>> {
        let mut jobs: Vec<JobUnit> = Vec::new();
        let mut seen = BTreeSet::new();
        let mut index = 0;

        for record in &table.records {
            if !self.accepts(record) {
                continue;
            }
            index += 1;
            let job = self.instantiate_one(record, index)?;
            if !seen.insert(job.id.clone()) {
                return Err(Error::template(
                    &self.id,
                    format!("two resource records both produce job id '{}'", job.id),
                ));
            }
            jobs.push(job);
        }

        tracing::debug!(template = %self.id, instances = jobs.len(), "expanded template");
        Ok(jobs)
    }
}

/// Drop characters that are awkward in identifiers, such as braces and spaces
fn slugify_template_id(id: &str) -> String {
    id.chars()
        .filter(|c| c.is_ascii_alphanumeric() || "-_.:/\\".contains(*c))
        .collect()
}

fn is_param_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn split_pattern(pattern: &str, engine: TemplateEngine) -> std::result::Result<Vec<Piece>, String> {
    match engine {
        TemplateEngine::Default => split_format(pattern),
        TemplateEngine::Jinja2 => split_jinja(pattern),
    }
}

fn push_text(pieces: &mut Vec<Piece>, text: &str) {
    if let Some(Piece::Text(last)) = pieces.last_mut() {
        last.push_str(text);
    } else if !text.is_empty() {
        pieces.push(Piece::Text(text.to_string()));
    }
}

fn split_format(pattern: &str) -> std::result::Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                push_text(&mut pieces, "{");
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                push_text(&mut pieces, "}");
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(format!("unterminated placeholder '{{{}'", name)),
                    }
                }
                if !is_param_name(&name) {
                    return Err(format!("malformed placeholder '{{{}}}'", name));
                }
                pieces.push(Piece::Param(name));
            }
            '}' => return Err("single '}' encountered in pattern".to_string()),
            other => push_text(&mut pieces, &other.to_string()),
        }
    }

    Ok(pieces)
}

fn split_jinja(pattern: &str) -> std::result::Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut rest = pattern;

    while let Some(start) = rest.find("{{") {
        push_text(&mut pieces, &rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in '{}'", pattern))?;
        let name = after[..end].trim();
        if !is_param_name(name) {
            return Err(format!("unsupported expression '{{{{ {} }}}}'", name));
        }
        pieces.push(Piece::Param(name.to_string()));
        rest = &after[end + 2..];
    }
    if rest.contains("{%") {
        return Err("jinja2 statements are not supported".to_string());
    }
    push_text(&mut pieces, rest);

    Ok(pieces)
}
