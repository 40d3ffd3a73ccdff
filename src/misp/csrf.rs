use anyhow::{anyhow, Result};
use scraper::{Html, Selector};

/// CakePHP SecurityComponent token triple rendered into every MISP form.
///
/// Tokens are page-scoped: each form submission needs a fresh set pulled
/// from the page that renders the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfTokens {
    pub key: String,
    pub fields: String,
    pub unlocked: String,
}

const KEY_SELECTOR: &str = r#"input[name="data[_Token][key]"]"#;
const FIELDS_SELECTOR: &str = r#"input[name="data[_Token][fields]"]"#;
const UNLOCKED_SELECTOR: &str = r#"input[name="data[_Token][unlocked]"]"#;

/// Extract the SecurityComponent token fields from a rendered MISP page.
///
/// The key field is mandatory; its absence means the markup changed or the
/// session expired. The fields/unlocked inputs are not rendered on every
/// form and default to empty.
pub fn extract_tokens(html: &str) -> Result<CsrfTokens> {
    let document = Html::parse_document(html);

    let key = field_value(&document, KEY_SELECTOR).ok_or_else(|| {
        anyhow!("CSRF token field data[_Token][key] not found; markup changed or session expired")
    })?;
    let fields = field_value(&document, FIELDS_SELECTOR).unwrap_or_default();
    let unlocked = field_value(&document, UNLOCKED_SELECTOR).unwrap_or_default();

    Ok(CsrfTokens {
        key,
        fields,
        unlocked,
    })
}

fn field_value(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_owned)
}
