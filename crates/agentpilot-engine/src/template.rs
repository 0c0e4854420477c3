//! Template rendering using minijinja.

use minijinja::{Environment, Value};

/// Jinja-compatible renderer for mixed text templates.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    /// Compiled render templates only need the built-in filters
    /// (`length`, `join`, `upper`, ...).
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Render `template` against a JSON context object.
    pub fn render(
        &self,
        template: &str,
        context: &serde_json::Value,
    ) -> Result<String, minijinja::Error> {
        let tmpl = self.env.template_from_str(template)?;
        tmpl.render(Value::from_serialize(context))
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}
