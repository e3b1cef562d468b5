//! Email template model.
//!
//! Templates are versioned: every edit bumps `version`, which also rolls the
//! render cache key. System templates cannot be deleted.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EmailTemplate {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub category: Option<String>,
    pub subject_template: String,
    pub body_template: String,
    #[builder(default = 1)]
    pub version: i32,
    #[builder(default = true)]
    pub is_active: bool,
    #[builder(default = false)]
    pub is_system: bool,
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Fields a template edit may change. Version bumping is handled by the store.
#[derive(Debug, Clone, Default)]
pub struct TemplateUpdate {
    pub subject_template: Option<String>,
    pub body_template: Option<String>,
    pub category: Option<String>,
}

impl EmailTemplate {
    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let template = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, name, category, subject_template, body_template, version,
                   is_active, is_system, created_by, created_at, updated_at
            FROM email_templates
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        Ok(template)
    }

    pub async fn insert(&self, db: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO email_templates (
                id, name, category, subject_template, body_template, version,
                is_active, is_system, created_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.category)
        .bind(&self.subject_template)
        .bind(&self.body_template)
        .bind(self.version)
        .bind(self.is_active)
        .bind(self.is_system)
        .bind(&self.created_by)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(db)
        .await?;

        Ok(())
    }

    /// Apply an edit, bumping the version.
    pub async fn apply_update(id: Uuid, update: &TemplateUpdate, db: &PgPool) -> Result<Self> {
        let template = sqlx::query_as::<_, Self>(
            r#"
            UPDATE email_templates
            SET subject_template = COALESCE($2, subject_template),
                body_template = COALESCE($3, body_template),
                category = COALESCE($4, category),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, category, subject_template, body_template, version,
                      is_active, is_system, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&update.subject_template)
        .bind(&update.body_template)
        .bind(&update.category)
        .fetch_one(db)
        .await?;

        Ok(template)
    }

    pub async fn deactivate(id: Uuid, db: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_templates
            SET is_active = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a template. Refused for system templates.
    pub async fn delete(id: Uuid, db: &PgPool) -> Result<()> {
        let is_system = sqlx::query_scalar::<_, bool>(
            "SELECT is_system FROM email_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(db)
        .await?;

        match is_system {
            None => bail!("template {id} not found"),
            Some(true) => bail!("template {id} is a system template and cannot be deleted"),
            Some(false) => {}
        }

        sqlx::query("DELETE FROM email_templates WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(())
    }
}
