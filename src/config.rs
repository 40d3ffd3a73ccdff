use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Form-login credentials for the MISP web UI.
#[derive(Debug, Clone)]
pub struct MispAuth {
    pub username: String,
    pub password: String,
}

/// Load form-login credentials from the environment
pub fn auth_from_env() -> Result<MispAuth> {
    let username = std::env::var("MISP_USERNAME")
        .ok()
        .filter(|v| !v.trim().is_empty());
    let password = std::env::var("MISP_PASSWORD")
        .ok()
        .filter(|v| !v.trim().is_empty());

    match (username, password) {
        (Some(username), Some(password)) => Ok(MispAuth { username, password }),
        _ => bail!("MISP_USERNAME and MISP_PASSWORD must be set"),
    }
}

/// Load the REST API key from the environment
pub fn api_key_from_env() -> Result<String> {
    std::env::var("MISP_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .context("MISP_API_KEY is required")
}

/// TLS verification policy for the HTTP session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertPolicy {
    /// Verify against the platform trust roots
    Default,
    /// Verify against a custom CA bundle
    Bundle(PathBuf),
    /// Skip certificate verification entirely
    Disabled,
}

impl CertPolicy {
    /// Resolve the policy from `MISP_CERT_VALIDATION` and
    /// `MISP_CA_BUNDLE` (alias `MISP_CA_CERT`).
    pub fn from_env() -> Result<Self> {
        let validation = std::env::var("MISP_CERT_VALIDATION").ok();
        let bundle = std::env::var("MISP_CA_BUNDLE")
            .ok()
            .or_else(|| std::env::var("MISP_CA_CERT").ok());
        Self::resolve(validation.as_deref(), bundle.as_deref())
    }

    /// Resolve the policy from raw env values.
    ///
    /// `MISP_CERT_VALIDATION=false` wins over any bundle. A bundle value
    /// may be a filesystem path or inline PEM text (with `\n` escapes as
    /// written in a .env file); inline PEM is persisted to a temp file so
    /// the HTTP client can consume it.
    fn resolve(validation: Option<&str>, bundle: Option<&str>) -> Result<Self> {
        if let Some(value) = validation {
            if !is_truthy(value) {
                return Ok(CertPolicy::Disabled);
            }
        }

        let Some(bundle) = bundle.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(CertPolicy::Default);
        };

        if bundle.contains("-----BEGIN CERTIFICATE-----")
            || bundle.contains("-----BEGIN TRUSTED CERTIFICATE-----")
        {
            let pem_text = bundle.replace("\\n", "\n");
            let path = std::env::temp_dir().join("misp_ca_cert_from_env.pem");
            std::fs::write(&path, pem_text)
                .with_context(|| format!("Failed to write inline CA cert to {:?}", path))?;
            return Ok(CertPolicy::Bundle(path));
        }

        let resolved = expand_tilde(Path::new(bundle))?;
        if !resolved.is_file() {
            bail!("CA bundle not found at path: {:?}", resolved);
        }
        Ok(CertPolicy::Bundle(resolved))
    }
}

/// Anything but the recognised falsy spellings counts as enabled
fn is_truthy(value: &str) -> bool {
    let text = value.trim().to_lowercase();
    !matches!(text.as_str(), "0" | "false" | "no" | "off" | "n")
}

/// Expand ~ to the user's home directory
fn expand_tilde(path: &Path) -> Result<PathBuf> {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            let home = dirs::home_dir().context("Could not determine home directory")?;
            return Ok(home.join(stripped));
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_validation_disabled() {
        let policy = CertPolicy::resolve(Some("false"), None).unwrap();
        assert_eq!(policy, CertPolicy::Disabled);

        // Disabling wins over a configured bundle
        let policy = CertPolicy::resolve(Some("FALSE"), Some("/does/not/exist.pem")).unwrap();
        assert_eq!(policy, CertPolicy::Disabled);
    }

    #[test]
    fn test_validation_falsy_spellings() {
        for value in ["0", "no", "off", "n", " No ", "OFF"] {
            let policy = CertPolicy::resolve(Some(value), None).unwrap();
            assert_eq!(policy, CertPolicy::Disabled, "value {:?}", value);
        }
    }

    #[test]
    fn test_validation_truthy_spellings() {
        for value in ["true", "1", "yes", "on"] {
            let policy = CertPolicy::resolve(Some(value), None).unwrap();
            assert_eq!(policy, CertPolicy::Default, "value {:?}", value);
        }
    }

    #[test]
    fn test_default_when_unset() {
        let policy = CertPolicy::resolve(None, None).unwrap();
        assert_eq!(policy, CertPolicy::Default);
    }

    #[test]
    fn test_bundle_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(file, "-----END CERTIFICATE-----").unwrap();

        let path = file.path().to_str().unwrap();
        let policy = CertPolicy::resolve(None, Some(path)).unwrap();
        assert_eq!(policy, CertPolicy::Bundle(file.path().to_path_buf()));
    }

    #[test]
    fn test_bundle_path_missing() {
        let err = CertPolicy::resolve(None, Some("/no/such/bundle.pem")).unwrap_err();
        assert!(err.to_string().contains("CA bundle not found"));
    }

    #[test]
    fn test_inline_pem_materialized() {
        let inline =
            "-----BEGIN CERTIFICATE-----\\nMIIBfake\\n-----END CERTIFICATE-----\\n";
        let policy = CertPolicy::resolve(None, Some(inline)).unwrap();

        let CertPolicy::Bundle(path) = policy else {
            panic!("Expected Bundle policy");
        };
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("-----BEGIN CERTIFICATE-----\nMIIBfake\n"));
    }
}
