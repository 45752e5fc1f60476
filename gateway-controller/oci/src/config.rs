//! Reads credentials from an OCI CLI configuration file.

use crate::Error;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

pub const DEFAULT_PROFILE: &str = "DEFAULT";

/// API-key credentials for a single profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OciConfig {
    pub user: String,
    pub fingerprint: String,
    pub tenancy: String,
    pub region: String,
    pub key_file: PathBuf,
}

// === impl OciConfig ===

impl OciConfig {
    /// Loads `profile` from the config file at `path`.
    pub fn load(path: &Path, profile: &str) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&contents, profile)
    }

    /// Parses `profile`, falling back to the `DEFAULT` profile for keys the
    /// profile does not set.
    pub fn parse(contents: &str, profile: &str) -> Result<Self, Error> {
        let sections = parse_sections(contents);
        if !sections.contains_key(profile) {
            return Err(Error::Config(format!("profile {profile} not found")));
        }
        let get = |key: &str| -> Result<String, Error> {
            sections
                .get(profile)
                .and_then(|s| s.get(key))
                .or_else(|| sections.get(DEFAULT_PROFILE).and_then(|s| s.get(key)))
                .cloned()
                .ok_or_else(|| Error::Config(format!("profile {profile} is missing {key}")))
        };

        if sections
            .get(profile)
            .map_or(false, |s| s.contains_key("pass_phrase"))
        {
            return Err(Error::Config(
                "encrypted API keys are not supported".to_string(),
            ));
        }

        Ok(Self {
            user: get("user")?,
            fingerprint: get("fingerprint")?,
            tenancy: get("tenancy")?,
            region: get("region")?,
            key_file: expand_home(&get("key_file")?),
        })
    }

    /// The `keyId` used in request signatures.
    pub fn key_id(&self) -> String {
        format!("{}/{}/{}", self.tenancy, self.user, self.fingerprint)
    }

    pub fn default_path() -> PathBuf {
        expand_home("~/.oci/config")
    }
}

fn parse_sections(contents: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections = HashMap::<String, HashMap<String, String>>::new();
    let mut current = None::<String>;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        if let (Some(section), Some((k, v))) = (current.as_ref(), line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    sections
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
# comment
[DEFAULT]
user=ocid1.user.oc1..aaaa
fingerprint=20:3b:97:13:55:1c
tenancy = ocid1.tenancy.oc1..bbbb
region=us-ashburn-1
key_file=/etc/oci/key.pem

[PHX]
region=us-phoenix-1
"#;

    #[test]
    fn parses_default_profile() {
        let cfg = OciConfig::parse(CONFIG, DEFAULT_PROFILE).unwrap();
        assert_eq!(
            cfg,
            OciConfig {
                user: "ocid1.user.oc1..aaaa".to_string(),
                fingerprint: "20:3b:97:13:55:1c".to_string(),
                tenancy: "ocid1.tenancy.oc1..bbbb".to_string(),
                region: "us-ashburn-1".to_string(),
                key_file: PathBuf::from("/etc/oci/key.pem"),
            }
        );
        assert_eq!(
            cfg.key_id(),
            "ocid1.tenancy.oc1..bbbb/ocid1.user.oc1..aaaa/20:3b:97:13:55:1c"
        );
    }

    #[test]
    fn profiles_inherit_from_default() {
        let cfg = OciConfig::parse(CONFIG, "PHX").unwrap();
        assert_eq!(cfg.region, "us-phoenix-1");
        assert_eq!(cfg.user, "ocid1.user.oc1..aaaa");
    }

    #[test]
    fn rejects_missing_profile_and_keys() {
        assert!(OciConfig::parse(CONFIG, "NOPE").is_err());
        let err = OciConfig::parse("[DEFAULT]\nuser=u\n", DEFAULT_PROFILE).unwrap_err();
        assert!(err.to_string().contains("missing fingerprint"), "{err}");
    }

    #[test]
    fn rejects_encrypted_keys() {
        let contents = format!("{CONFIG}\n[ENC]\npass_phrase=secret\n");
        assert!(OciConfig::parse(&contents, "ENC").is_err());
    }
}
