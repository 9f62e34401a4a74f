use tera::{Context, Error as TeraError, Tera};

/// Render a one-off template string against the given context.
///
/// Missing variables are hard errors so a typo in a config template fails
/// the step instead of silently rendering an empty string.
pub fn render_template(template: &str, context: &Context) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    tera.render("inline_template", context)
}
