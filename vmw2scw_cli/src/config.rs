//! The YAML configuration document (§6 "Config document") plus its
//! environment-variable fallback (§6 "Environment variables").
//!
//! Precedence for every secret-shaped field: an explicit value in the
//! document, then a `*_env` indirection naming another variable to read,
//! then the bare environment variable listed in §6, then a hard failure
//! if the field is required. Secrets are never written back out: `Config`
//! has no `Serialize` impl.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vmware: VmwareConfig,
    #[serde(default)]
    pub scaleway: ScalewayConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct VmwareConfig {
    pub vcenter: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_env: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScalewayConfig {
    pub access_key: Option<String>,
    pub access_key_env: Option<String>,
    pub secret_key: Option<String>,
    pub secret_key_env: Option<String>,
    pub project_id: Option<String>,
    pub default_zone: Option<String>,
    pub s3_region: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub compress_qcow2: bool,
    pub virtio_win_iso: Option<PathBuf>,
    #[serde(default)]
    pub keep_intermediates: bool,
    pub ovmf_path: Option<PathBuf>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            compress_qcow2: false,
            virtio_win_iso: None,
            keep_intermediates: false,
            ovmf_path: None,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./vmw2scw-work")
}

impl Config {
    /// Load the YAML document at `path`, or fall back to an all-default
    /// document (so every field still resolves through the environment)
    /// when no `--config` was given.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = fs_err::read_to_string(path)?;
                Ok(serde_yaml::from_str(&raw)?)
            }
            None => Ok(serde_yaml::from_str("{}")?),
        }
    }
}

/// Resolve a secret field through the §6 precedence: explicit value,
/// `*_env` indirection, bare fallback variable, then `None`.
fn resolve(explicit: Option<&String>, indirection: Option<&String>, fallback_var: &str) -> Option<String> {
    if let Some(value) = explicit {
        return Some(value.clone());
    }
    if let Some(var) = indirection {
        if let Ok(value) = std::env::var(var) {
            return Some(value);
        }
    }
    std::env::var(fallback_var).ok()
}

/// Fully-resolved vCenter credentials, after folding in environment
/// fallbacks (§6 "Environment variables").
pub struct ResolvedVmware {
    pub vcenter: String,
    pub username: String,
    pub password: String,
    pub insecure: bool,
}

impl Config {
    pub fn resolve_vmware(&self) -> anyhow::Result<ResolvedVmware> {
        let vcenter = self
            .vmware
            .vcenter
            .clone()
            .or_else(|| std::env::var("VMWARE_VCENTER").ok())
            .ok_or_else(|| anyhow::anyhow!("vmware.vcenter is not set in config or VMWARE_VCENTER"))?;
        let username = self
            .vmware
            .username
            .clone()
            .or_else(|| std::env::var("VMWARE_USERNAME").ok())
            .ok_or_else(|| anyhow::anyhow!("vmware.username is not set in config or VMWARE_USERNAME"))?;
        let password = resolve(self.vmware.password.as_ref(), self.vmware.password_env.as_ref(), "VMWARE_PASSWORD")
            .ok_or_else(|| anyhow::anyhow!("vmware.password is not set in config, password_env, or VMWARE_PASSWORD"))?;
        let insecure = self.vmware.insecure
            || std::env::var("VMWARE_INSECURE").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        Ok(ResolvedVmware { vcenter, username, password, insecure })
    }

    pub fn resolve_scaleway(&self) -> anyhow::Result<ResolvedScaleway> {
        let access_key = resolve(self.scaleway.access_key.as_ref(), self.scaleway.access_key_env.as_ref(), "SCW_ACCESS_KEY")
            .ok_or_else(|| anyhow::anyhow!("scaleway.access_key is not set in config, access_key_env, or SCW_ACCESS_KEY"))?;
        let secret_key = resolve(self.scaleway.secret_key.as_ref(), self.scaleway.secret_key_env.as_ref(), "SCW_SECRET_KEY")
            .ok_or_else(|| anyhow::anyhow!("scaleway.secret_key is not set in config, secret_key_env, or SCW_SECRET_KEY"))?;
        let project_id = self
            .scaleway
            .project_id
            .clone()
            .or_else(|| std::env::var("SCW_PROJECT_ID").ok())
            .ok_or_else(|| anyhow::anyhow!("scaleway.project_id is not set in config or SCW_PROJECT_ID"))?;
        let default_zone = self
            .scaleway
            .default_zone
            .clone()
            .or_else(|| std::env::var("SCW_DEFAULT_ZONE").ok())
            .unwrap_or_else(|| "fr-par-1".to_string());
        let s3_bucket = self
            .scaleway
            .s3_bucket
            .clone()
            .or_else(|| std::env::var("SCW_S3_BUCKET").ok())
            .ok_or_else(|| anyhow::anyhow!("scaleway.s3_bucket is not set in config or SCW_S3_BUCKET"))?;
        let s3_region = self
            .scaleway
            .s3_region
            .clone()
            .or_else(|| std::env::var("SCW_S3_REGION").ok())
            .unwrap_or_else(|| default_zone.clone());
        let s3_endpoint = self
            .scaleway
            .s3_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://s3.{s3_region}.scw.cloud"));
        Ok(ResolvedScaleway { access_key, secret_key, project_id, default_zone, s3_bucket, s3_region, s3_endpoint })
    }
}

pub struct ResolvedScaleway {
    pub access_key: String,
    pub secret_key: String,
    pub project_id: String,
    pub default_zone: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_document_still_parses_as_all_defaults() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.conversion.work_dir, default_work_dir());
        assert!(!cfg.conversion.compress_qcow2);
    }

    #[test]
    fn yaml_document_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "vmware:\n  vcenter: vc.example.com\n  username: admin\n  password: hunter2\nscaleway:\n  access_key: SCWXXX\n  secret_key: secret\n  project_id: proj-1\n  s3_bucket: migration\nconversion:\n  work_dir: /data/work\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        let vmware = cfg.resolve_vmware().unwrap();
        assert_eq!(vmware.vcenter, "vc.example.com");
        assert_eq!(vmware.password, "hunter2");

        let scaleway = cfg.resolve_scaleway().unwrap();
        assert_eq!(scaleway.access_key, "SCWXXX");
        assert_eq!(scaleway.s3_bucket, "migration");
        assert_eq!(cfg.conversion.work_dir, PathBuf::from("/data/work"));
    }

    #[test]
    fn password_env_indirection_takes_precedence_over_bare_var() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("VMW2SCW_TEST_PW", "from-indirection");
            std::env::set_var("VMWARE_PASSWORD", "from-bare-var");
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "vmware:\n  vcenter: vc.example.com\n  username: admin\n  password_env: VMW2SCW_TEST_PW\n",
        )
        .unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        let vmware = cfg.resolve_vmware().unwrap();
        assert_eq!(vmware.password, "from-indirection");
        unsafe {
            std::env::remove_var("VMW2SCW_TEST_PW");
            std::env::remove_var("VMWARE_PASSWORD");
        }
    }
}
