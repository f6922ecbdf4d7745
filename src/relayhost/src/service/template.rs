/// Unit-file templates, compiled into the binary so provisioning works
/// from the binary alone.
use crate::error::ProvisionError;
use std::path::PathBuf;
use tera::{Context, Tera};

pub const RELAY_UNIT_TEMPLATE: &str = "relay.service.j2";

static RELAY_UNIT: &str = include_str!("templates/relay.service.j2");

/// All embedded templates as (name, content) pairs.
pub const ALL_TEMPLATES: &[(&str, &str)] = &[(RELAY_UNIT_TEMPLATE, RELAY_UNIT)];

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Create a renderer from the embedded templates.
    pub fn from_embedded() -> Result<Self, ProvisionError> {
        let mut tera = Tera::default();
        for (name, content) in ALL_TEMPLATES {
            tera.add_raw_template(name, content)
                .map_err(|e| template_error(name, e))?;
            tracing::debug!("[TemplateRenderer] Loaded embedded template: {}", name);
        }
        Ok(Self { tera })
    }

    /// Render a template with a Tera Context directly
    pub fn render_with_context(
        &self,
        template_name: &str,
        context: &Context,
    ) -> Result<String, ProvisionError> {
        let rendered = self
            .tera
            .render(template_name, context)
            .map_err(|e| template_error(template_name, e))?;

        tracing::debug!(
            "[TemplateRenderer] Rendered template {} ({} bytes)",
            template_name,
            rendered.len()
        );
        Ok(rendered)
    }
}

fn template_error(name: &str, e: tera::Error) -> ProvisionError {
    ProvisionError::Config {
        path: PathBuf::from(format!("(embedded)/{}", name)),
        cause: format!("Failed to render template: {}", e),
    }
}
