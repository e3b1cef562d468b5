//! `{{placeholder}}` substitution over stored templates.
//!
//! Rendering is total: a placeholder without a matching key is left in the
//! output literally and reported as a warning, never an error. Fetched
//! templates are cached per id; edits bump the stored version and the
//! service layer invalidates the entry.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::store::{EmailTemplate, Store};

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}").unwrap();
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template {0} not found")]
    NotFound(Uuid),
    #[error("template {0} is not active")]
    Inactive(Uuid),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of rendering a template against job data.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
    /// Placeholders encountered across subject and body.
    pub placeholder_count: usize,
    /// Placeholder names that had no value and were left literal.
    pub unresolved: Vec<String>,
}

/// Substitute placeholders in one string. Returns the output, the number of
/// placeholders seen, and the names left unresolved.
pub fn render_str(input: &str, data: &HashMap<String, String>) -> (String, usize, Vec<String>) {
    let mut seen = 0;
    let mut unresolved = Vec::new();

    let output = PLACEHOLDER.replace_all(input, |caps: &regex::Captures<'_>| {
        seen += 1;
        let name = &caps[1];
        match data.get(name) {
            Some(value) => value.clone(),
            None => {
                unresolved.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    (output.into_owned(), seen, unresolved)
}

pub struct TemplateEngine {
    store: Arc<dyn Store>,
    cache: RwLock<HashMap<Uuid, Arc<EmailTemplate>>>,
}

impl TemplateEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Render the template's subject and body against `data`.
    pub async fn render(
        &self,
        template_id: Uuid,
        data: &HashMap<String, String>,
    ) -> Result<RenderedEmail, TemplateError> {
        let template = self.fetch(template_id).await?;

        let (subject, subject_count, mut unresolved) =
            render_str(&template.subject_template, data);
        let (body, body_count, body_unresolved) = render_str(&template.body_template, data);
        unresolved.extend(body_unresolved);

        if !unresolved.is_empty() {
            warn!(
                template_id = %template_id,
                version = template.version,
                unresolved = ?unresolved,
                "template rendered with unresolved placeholders"
            );
        }

        Ok(RenderedEmail {
            subject,
            body,
            placeholder_count: subject_count + body_count,
            unresolved,
        })
    }

    /// Drop the cached copy; the next render refetches the current version.
    pub fn invalidate(&self, template_id: Uuid) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&template_id);
    }

    async fn fetch(&self, template_id: Uuid) -> Result<Arc<EmailTemplate>, TemplateError> {
        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(template) = cache.get(&template_id) {
                return Ok(Arc::clone(template));
            }
        }

        let template = self
            .store
            .get_template(template_id)
            .await?
            .ok_or(TemplateError::NotFound(template_id))?;

        if !template.is_active {
            return Err(TemplateError::Inactive(template_id));
        }

        let template = Arc::new(template);
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(template_id, Arc::clone(&template));

        Ok(template)
    }
}
