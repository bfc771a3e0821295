//! Email template rendering with Handlebars
//!
//! Every email is rendered twice, once as HTML and once as plain text. Each format
//! combines a shared layout (`base.html.hbs` / `base.txt.hbs`) with the content
//! fragment of the requested template, which the layout includes as the `content`
//! partial. Supports:
//! - YAML frontmatter in content fragments (subject)
//! - Locale-specific template variants (`name.fr.html.hbs`)
//! - A `T` helper translating keys from per-locale YAML catalogs
//!
//! Nothing is cached: files are read and compiled on every call, so a single engine
//! can be shared freely between tasks.

use handlebars::{
	Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
	RenderErrorReason,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::prelude::*;
use crate::settings::EmailSettings;

const LAYOUT_NAME: &str = "base";
const CONTENT_PARTIAL: &str = "content";

/// Metadata extracted from template frontmatter
#[derive(Debug, Default, Deserialize)]
pub struct TemplateMetadata {
	/// Email subject line (may use the `T` helper and template variables)
	#[serde(default)]
	pub subject: Option<String>,
}

/// Result of template rendering
#[derive(Debug)]
pub struct RenderResult {
	/// Subject extracted from template frontmatter
	pub subject: Option<String>,
	/// Rendered HTML body
	pub html_body: String,
	/// Rendered plain text body
	pub text_body: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
	Html,
	Text,
}

impl Format {
	fn extension(self) -> &'static str {
		match self {
			Format::Html => "html.hbs",
			Format::Text => "txt.hbs",
		}
	}
}

/// Flat translation catalog: dotted key -> message
type Catalog = HashMap<String, String>;

/// `{{T "key" name=value}}` helper bound to one locale's catalog
struct TranslateHelper {
	catalog: Arc<Catalog>,
}

impl HelperDef for TranslateHelper {
	fn call<'reg: 'rc, 'rc>(
		&self,
		h: &Helper<'rc>,
		r: &'reg Handlebars<'reg>,
		_: &'rc Context,
		_: &mut RenderContext<'reg, 'rc>,
		out: &mut dyn Output,
	) -> HelperResult {
		let key = h
			.param(0)
			.and_then(|p| p.value().as_str())
			.ok_or(RenderErrorReason::ParamNotFoundForIndex("T", 0))?;

		let args: HashMap<&str, String> = h
			.hash()
			.iter()
			.map(|(name, value)| {
				let text = match value.value() {
					serde_json::Value::String(s) => s.clone(),
					other => other.to_string(),
				};
				(*name, text)
			})
			.collect();

		let translated = translate(&self.catalog, key, &args);
		out.write(&r.get_escape_fn()(&translated))?;
		Ok(())
	}
}

/// Look up `key` and substitute `{name}` placeholders from `args`
///
/// Unknown keys translate to the key itself.
fn translate(catalog: &Catalog, key: &str, args: &HashMap<&str, String>) -> String {
	let Some(message) = catalog.get(key) else {
		debug!("Missing translation for key '{}'", key);
		return key.to_string();
	};

	fill_placeholders(message, args)
}

/// Single left-to-right pass: substituted values are never scanned again.
/// Unknown placeholders are kept as written.
fn fill_placeholders(message: &str, args: &HashMap<&str, String>) -> String {
	let mut result = String::with_capacity(message.len());
	let mut rest = message;

	while let Some(start) = rest.find('{') {
		result.push_str(&rest[..start]);
		let after = &rest[start + 1..];
		let name = after.find('}').map(|end| &after[..end]).filter(|name| !name.contains('{'));
		match name {
			Some(name) => {
				match args.get(name) {
					Some(value) => result.push_str(value),
					None => {
						result.push('{');
						result.push_str(name);
						result.push('}');
					}
				}
				rest = &after[name.len() + 1..];
			}
			None => {
				result.push('{');
				rest = after;
			}
		}
	}
	result.push_str(rest);
	result
}

/// Flatten nested YAML maps into dotted keys
fn flatten_catalog(prefix: &str, value: &serde_yaml::Value, out: &mut Catalog) {
	match value {
		serde_yaml::Value::Mapping(map) => {
			for (k, v) in map {
				let Some(k) = k.as_str() else { continue };
				let key = if prefix.is_empty() { k.to_string() } else { format!("{}.{}", prefix, k) };
				flatten_catalog(&key, v, out);
			}
		}
		serde_yaml::Value::String(s) => {
			out.insert(prefix.to_string(), s.clone());
		}
		serde_yaml::Value::Number(n) => {
			out.insert(prefix.to_string(), n.to_string());
		}
		serde_yaml::Value::Bool(b) => {
			out.insert(prefix.to_string(), b.to_string());
		}
		_ => {}
	}
}

/// Template engine for email rendering
#[derive(Debug, Clone)]
pub struct TemplateEngine {
	template_dir: PathBuf,
	locales_dir: PathBuf,
	default_locale: String,
}

impl TemplateEngine {
	/// Create new template engine
	pub fn new(
		template_dir: impl Into<PathBuf>,
		locales_dir: impl Into<PathBuf>,
		default_locale: impl Into<String>,
	) -> Self {
		Self {
			template_dir: template_dir.into(),
			locales_dir: locales_dir.into(),
			default_locale: default_locale.into(),
		}
	}

	pub fn from_settings(settings: &EmailSettings) -> Self {
		Self::new(&settings.template_dir, &settings.locales_dir, &settings.default_locale)
	}

	/// Empty locale resolves to the default locale
	pub fn resolve_locale<'a>(&'a self, locale: &'a str) -> &'a str {
		let locale = locale.trim();
		if locale.is_empty() {
			&self.default_locale
		} else {
			locale
		}
	}

	/// Parse YAML frontmatter from template content
	///
	/// Frontmatter is delimited by `---` at the start of the file:
	/// ```text
	/// ---
	/// subject: Email Subject
	/// ---
	/// Template content here...
	/// ```
	///
	/// Returns (metadata, content_without_frontmatter)
	fn parse_frontmatter(content: &str) -> (TemplateMetadata, &str) {
		let trimmed = content.trim_start();

		let Some(after_first) = trimmed.strip_prefix("---") else {
			return (TemplateMetadata::default(), content);
		};

		if let Some(end_pos) = after_first.find("\n---") {
			let yaml_content = &after_first[..end_pos];
			let template_content = &after_first[end_pos + 4..];

			match serde_yaml::from_str(yaml_content) {
				Ok(metadata) => (metadata, template_content.trim_start_matches(['\r', '\n'])),
				Err(e) => {
					warn!("Failed to parse frontmatter YAML: {}", e);
					(TemplateMetadata::default(), content)
				}
			}
		} else {
			// No closing delimiter found
			(TemplateMetadata::default(), content)
		}
	}

	/// Try to load a template file, returning None if it doesn't exist
	fn try_load_template(path: &Path) -> Option<String> {
		std::fs::read_to_string(path).ok()
	}

	/// Resolve template file with locale fallback
	///
	/// For template "signature_reminder" with locale "fr":
	/// 1. Try: signature_reminder.fr.html.hbs
	/// 2. Fallback: signature_reminder.html.hbs
	fn load_template(&self, template_name: &str, format: Format, locale: &str) -> ClResult<String> {
		if template_name.is_empty()
			|| template_name.contains(['/', '\\'])
			|| template_name.starts_with('.')
		{
			return Err(Error::TemplateNotFound(format!("invalid template name '{}'", template_name)));
		}

		let ext = format.extension();
		let locale_path = self.template_dir.join(format!("{}.{}.{}", template_name, locale, ext));
		if let Some(content) = Self::try_load_template(&locale_path) {
			debug!("Loaded locale-specific template: {}", locale_path.display());
			return Ok(content);
		}

		let default_path = self.template_dir.join(format!("{}.{}", template_name, ext));
		match Self::try_load_template(&default_path) {
			Some(content) => {
				debug!("Loaded default template: {}", default_path.display());
				Ok(content)
			}
			None => Err(Error::TemplateNotFound(format!(
				"{} (locale: {})",
				default_path.display(),
				locale
			))),
		}
	}

	/// Load the translation catalog for a locale, falling back to the default locale
	fn load_catalog(&self, locale: &str) -> ClResult<Catalog> {
		let mut candidates = vec![locale];
		if locale != self.default_locale {
			candidates.push(&self.default_locale);
		}

		for candidate in candidates {
			let path = self.locales_dir.join(format!("{}.yaml", candidate));
			let Some(content) = Self::try_load_template(&path) else { continue };
			let value: serde_yaml::Value = serde_yaml::from_str(&content).map_err(|e| {
				Error::RenderError(format!("failed to parse catalog {}: {}", path.display(), e))
			})?;
			let mut catalog = Catalog::new();
			flatten_catalog("", &value, &mut catalog);
			return Ok(catalog);
		}

		debug!("No translation catalog for locale '{}'", locale);
		Ok(Catalog::new())
	}

	fn registry(format: Format, catalog: Arc<Catalog>) -> Handlebars<'static> {
		let mut handlebars = Handlebars::new();

		// Enable strict mode to catch undefined variables
		handlebars.set_strict_mode(true);
		if format == Format::Text {
			handlebars.register_escape_fn(handlebars::no_escape);
		}
		handlebars.register_helper("T", Box::new(TranslateHelper { catalog }));
		handlebars
	}

	/// Render one format: layout + content fragment. Returns (subject, body).
	fn render_format(
		&self,
		template_name: &str,
		format: Format,
		locale: &str,
		vars: &serde_json::Value,
		catalog: &Arc<Catalog>,
	) -> ClResult<(Option<String>, String)> {
		let layout = self.load_template(LAYOUT_NAME, format, locale)?;
		let content = self.load_template(template_name, format, locale)?;
		let (metadata, fragment) = Self::parse_frontmatter(&content);

		let mut handlebars = Self::registry(format, catalog.clone());
		handlebars.register_partial(CONTENT_PARTIAL, fragment).map_err(|e| {
			Error::RenderError(format!("failed to parse template '{}': {}", template_name, e))
		})?;
		handlebars.register_template_string(LAYOUT_NAME, layout).map_err(|e| {
			Error::RenderError(format!("failed to parse layout '{}': {}", LAYOUT_NAME, e))
		})?;

		// Subject is a header, never HTML-escaped
		let subject = match metadata.subject {
			Some(subject) => {
				let rendered = Self::registry(Format::Text, catalog.clone())
					.render_template(&subject, vars)
					.map_err(|e| Error::RenderError(format!("failed to render subject: {}", e)))?;
				Some(rendered.trim().to_string())
			}
			None => None,
		};

		let body = handlebars.render(LAYOUT_NAME, vars).map_err(|e| {
			Error::RenderError(format!(
				"failed to render {} template '{}': {}",
				format.extension(),
				template_name,
				e
			))
		})?;

		Ok((subject, body))
	}

	/// Render email template with variables and locale
	///
	/// Both formats must exist; a missing fragment or layout fails with
	/// `TemplateNotFound`, a parse or execution failure with `RenderError`.
	pub fn render(
		&self,
		template_name: &str,
		locale: &str,
		vars: &serde_json::Value,
	) -> ClResult<RenderResult> {
		let locale = self.resolve_locale(locale);
		let catalog = Arc::new(self.load_catalog(locale)?);

		let (html_subject, html_body) =
			self.render_format(template_name, Format::Html, locale, vars, &catalog)?;
		let (text_subject, text_body) =
			self.render_format(template_name, Format::Text, locale, vars, &catalog)?;

		Ok(RenderResult { subject: html_subject.or(text_subject), html_body, text_body })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_frontmatter_basic() {
		let content = r"---
subject: Test Subject
---
Hello {{name}}!";

		let (metadata, template) = TemplateEngine::parse_frontmatter(content);
		assert_eq!(metadata.subject, Some("Test Subject".to_string()));
		assert_eq!(template, "Hello {{name}}!");
	}

	#[test]
	fn test_parse_frontmatter_no_frontmatter() {
		let content = "Hello {{name}}!";

		let (metadata, template) = TemplateEngine::parse_frontmatter(content);
		assert!(metadata.subject.is_none());
		assert_eq!(template, "Hello {{name}}!");
	}

	#[test]
	fn test_parse_frontmatter_unclosed() {
		let content = r"---
subject: Test
Hello!";

		let (metadata, template) = TemplateEngine::parse_frontmatter(content);
		assert!(metadata.subject.is_none());
		assert_eq!(template, content);
	}

	#[test]
	fn test_translate_substitutes_placeholders() {
		let mut catalog = Catalog::new();
		catalog.insert("greeting".into(), "Bonjour {name}, {count} documents".into());

		let mut args = HashMap::new();
		args.insert("name", "Alice".to_string());
		args.insert("count", "2".to_string());

		assert_eq!(translate(&catalog, "greeting", &args), "Bonjour Alice, 2 documents");
		assert_eq!(translate(&catalog, "missing.key", &args), "missing.key");
	}

	#[test]
	fn test_substituted_values_are_not_expanded() {
		let mut args = HashMap::new();
		args.insert("name", "{document}".to_string());
		args.insert("document", "Contrat.pdf".to_string());

		assert_eq!(
			fill_placeholders("{name} signe {document}", &args),
			"{document} signe Contrat.pdf"
		);
		assert_eq!(fill_placeholders("{document}{name}", &args), "Contrat.pdf{document}");
	}

	#[test]
	fn test_unmatched_braces_are_kept() {
		let mut args = HashMap::new();
		args.insert("name", "Alice".to_string());

		assert_eq!(fill_placeholders("{unknown} {name}", &args), "{unknown} Alice");
		assert_eq!(fill_placeholders("{{name}}", &args), "{Alice}");
		assert_eq!(fill_placeholders("open { brace {name", &args), "open { brace {name");
		assert_eq!(fill_placeholders("", &args), "");
	}

	#[test]
	fn test_flatten_nested_catalog() {
		let yaml = "reminder:\n  subject: Rappel\n  days: 3\nfooter: Merci\n";
		let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
		let mut catalog = Catalog::new();
		flatten_catalog("", &value, &mut catalog);

		assert_eq!(catalog.get("reminder.subject").map(String::as_str), Some("Rappel"));
		assert_eq!(catalog.get("reminder.days").map(String::as_str), Some("3"));
		assert_eq!(catalog.get("footer").map(String::as_str), Some("Merci"));
	}

	#[test]
	fn test_helper_escapes_html_only() {
		let mut catalog = Catalog::new();
		catalog.insert("hello".into(), "Hi {name}".into());
		let catalog = Arc::new(catalog);
		let vars = serde_json::json!({ "name": "<b>Bob</b>" });

		let html = TemplateEngine::registry(Format::Html, catalog.clone());
		let out = html.render_template(r#"{{T "hello" name=name}}"#, &vars).unwrap();
		assert_eq!(out, "Hi &lt;b&gt;Bob&lt;/b&gt;");

		let text = TemplateEngine::registry(Format::Text, catalog);
		let out = text.render_template(r#"{{T "hello" name=name}}"#, &vars).unwrap();
		assert_eq!(out, "Hi <b>Bob</b>");
	}

	#[test]
	fn test_missing_variable_in_strict_mode() {
		let handlebars = TemplateEngine::registry(Format::Text, Arc::new(Catalog::new()));

		let template = "Hello {{name}}, your email is {{email}}";
		let data = serde_json::json!({"name": "Alice"});

		let result = handlebars.render_template(template, &data);
		assert!(result.is_err());
	}

	#[test]
	fn test_resolve_locale() {
		let engine = TemplateEngine::new("/nonexistent", "/nonexistent", "en");
		assert_eq!(engine.resolve_locale(""), "en");
		assert_eq!(engine.resolve_locale("  "), "en");
		assert_eq!(engine.resolve_locale("fr"), "fr");
	}

	#[test]
	fn test_rejects_path_like_template_names() {
		let engine = TemplateEngine::new("/nonexistent", "/nonexistent", "en");
		let vars = serde_json::json!({});
		for name in ["", "../secret", "a/b", ".hidden"] {
			assert!(matches!(engine.render(name, "en", &vars), Err(Error::TemplateNotFound(_))));
		}
	}
}

// vim: ts=4
