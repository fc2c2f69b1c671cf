//! Manifest Validator
//!
//! 登録前にプラグインの識別子・バージョン・依存関係・整合性ハッシュ・署名を検証する。
//! 検証は副作用を持たず、失敗時は具体的な理由を `ManifestError` で返す。

use base64::prelude::{Engine as _, BASE64_STANDARD};
use regex::Regex;
use ring::signature::{UnparsedPublicKey, ED25519};
use tracing::debug;

use super::types::PluginManifest;
use crate::config::ValidatorConfig;
use crate::error::{Error, ManifestError, Result};

/// Parsed `MAJOR.MINOR.PATCH`; pre-release and build suffixes are accepted but ignored.
pub type Version = (u64, u64, u64);

pub fn parse_version(version: &str) -> Option<Version> {
    let core = version
        .split_once('+')
        .map_or(version, |(core, _)| core);
    let core = core.split_once('-').map_or(core, |(core, _)| core);

    let mut parts = core.split('.');
    let mut next = || -> Option<u64> {
        let part = parts.next()?;
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let parsed = (next()?, next()?, next()?);
    parts.next().is_none().then_some(parsed)
}

/// マニフェスト検証器
#[derive(Debug)]
pub struct ManifestValidator {
    config: ValidatorConfig,
    id_pattern: Regex,
    min_version: Version,
    trusted_keys: Vec<Vec<u8>>,
}

impl ManifestValidator {
    pub fn new(config: ValidatorConfig) -> Result<Self> {
        let min_version = parse_version(&config.min_version).ok_or_else(|| {
            Error::Config(format!(
                "min_version {:?} is not a semantic version",
                config.min_version
            ))
        })?;

        let id_pattern = Regex::new(r"^[a-z0-9_]+$")
            .map_err(|e| Error::Config(format!("plugin id pattern: {}", e)))?;

        let trusted_keys = config
            .trusted_keys
            .iter()
            .map(|key| {
                BASE64_STANDARD
                    .decode(key)
                    .map_err(|e| Error::Config(format!("trusted key {:?}: {}", key, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            id_pattern,
            min_version,
            trusted_keys,
        })
    }

    pub fn is_hardened(&self) -> bool {
        self.config.hardened
    }

    /// 登録用の完全な検証
    ///
    /// `is_registered` は依存プラグインが登録済みかを返す。
    pub fn validate(
        &self,
        manifest: &PluginManifest,
        is_registered: impl Fn(&str) -> bool,
    ) -> std::result::Result<(), ManifestError> {
        self.validate_standalone(manifest)?;

        for dependency in &manifest.dependencies {
            if dependency == &manifest.plugin_id {
                return Err(ManifestError::SelfDependency);
            }
            if !is_registered(dependency) {
                return Err(ManifestError::MissingDependency(dependency.clone()));
            }
        }
        Ok(())
    }

    /// 依存関係以外の検証（レジストリなしで実行可能）
    pub fn validate_standalone(
        &self,
        manifest: &PluginManifest,
    ) -> std::result::Result<(), ManifestError> {
        self.check_id(manifest)?;
        self.check_version(manifest)?;
        self.check_integrity(manifest)?;
        self.check_signature(manifest)?;
        debug!(plugin_id = %manifest.plugin_id, "Manifest passed validation");
        Ok(())
    }

    fn check_id(&self, manifest: &PluginManifest) -> std::result::Result<(), ManifestError> {
        if self.id_pattern.is_match(&manifest.plugin_id) {
            Ok(())
        } else {
            Err(ManifestError::InvalidId(manifest.plugin_id.clone()))
        }
    }

    fn check_version(&self, manifest: &PluginManifest) -> std::result::Result<(), ManifestError> {
        let version = parse_version(&manifest.version)
            .ok_or_else(|| ManifestError::InvalidVersion(manifest.version.clone()))?;
        if version < self.min_version {
            return Err(ManifestError::VersionTooLow {
                version: manifest.version.clone(),
                minimum: self.config.min_version.clone(),
            });
        }
        Ok(())
    }

    fn check_integrity(&self, manifest: &PluginManifest) -> std::result::Result<(), ManifestError> {
        let Some(expected) = manifest.integrity_hash.as_deref() else {
            return Ok(());
        };
        let computed = manifest.compute_integrity_hash().map_err(|e| {
            ManifestError::IntegrityMismatch {
                expected: expected.to_string(),
                computed: e.to_string(),
            }
        })?;
        if computed.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(ManifestError::IntegrityMismatch {
                expected: expected.to_string(),
                computed,
            })
        }
    }

    fn check_signature(&self, manifest: &PluginManifest) -> std::result::Result<(), ManifestError> {
        let (signature, public_key) = match (&manifest.signature, &manifest.public_key) {
            (Some(signature), Some(public_key)) => (signature, public_key),
            (None, None) if !self.config.hardened => return Ok(()),
            (Some(_), None) if !self.config.hardened => {
                return Err(ManifestError::InvalidSignature(
                    "signature present without a public key".to_string(),
                ))
            }
            // 公開鍵だけの宣言は署名なしと同じ扱い
            (None, Some(_)) if !self.config.hardened => return Ok(()),
            _ => return Err(ManifestError::MissingSignature),
        };

        let key_bytes = BASE64_STANDARD
            .decode(public_key)
            .map_err(|e| ManifestError::InvalidSignature(format!("public key encoding: {}", e)))?;
        let signature_bytes = BASE64_STANDARD
            .decode(signature)
            .map_err(|e| ManifestError::InvalidSignature(format!("signature encoding: {}", e)))?;
        let message = manifest
            .signing_bytes()
            .map_err(|e| ManifestError::InvalidSignature(e.to_string()))?;

        UnparsedPublicKey::new(&ED25519, &key_bytes)
            .verify(&message, &signature_bytes)
            .map_err(|_| {
                ManifestError::InvalidSignature("signature does not match manifest".to_string())
            })?;

        if self.config.hardened
            && !self.trusted_keys.is_empty()
            && !self.trusted_keys.iter().any(|key| key == &key_bytes)
        {
            return Err(ManifestError::UntrustedKey);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionLevel;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn key_pair() -> Ed25519KeyPair {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap()
    }

    fn manifest() -> PluginManifest {
        PluginManifest::new("valve_ctl", "Valve Control", "1.0.0", "ops")
            .with_permission("valve", PermissionLevel::Control)
    }

    fn validator(hardened: bool) -> ManifestValidator {
        ManifestValidator::new(ValidatorConfig {
            hardened,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("1.2.3-beta.1+build5"), Some((1, 2, 3)));
        assert_eq!(parse_version("1.2"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version("v1.2.3"), None);
        assert_eq!(parse_version("1..3"), None);
    }

    #[test]
    fn test_valid_manifest_passes() {
        assert!(validator(false).validate(&manifest(), |_| false).is_ok());
    }

    #[test]
    fn test_id_pattern() {
        let v = validator(false);
        for bad in ["Valve", "valve-ctl", "", "valve ctl", "välve"] {
            let mut m = manifest();
            m.plugin_id = bad.to_string();
            assert!(
                matches!(v.validate(&m, |_| true), Err(ManifestError::InvalidId(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_version_minimum() {
        let v = ManifestValidator::new(ValidatorConfig {
            min_version: "1.1.0".to_string(),
            ..Default::default()
        })
        .unwrap();
        let result = v.validate(&manifest(), |_| true);
        assert!(matches!(result, Err(ManifestError::VersionTooLow { .. })));

        let mut newer = manifest();
        newer.version = "1.10.0".to_string();
        assert!(v.validate(&newer, |_| true).is_ok());

        let mut garbage = manifest();
        garbage.version = "latest".to_string();
        assert!(matches!(
            v.validate(&garbage, |_| true),
            Err(ManifestError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_dependencies_must_be_registered() {
        let v = validator(false);
        let m = manifest().with_dependency("weather");
        assert_eq!(
            v.validate(&m, |_| false),
            Err(ManifestError::MissingDependency("weather".to_string()))
        );
        assert!(v.validate(&m, |id| id == "weather").is_ok());

        let own = manifest().with_dependency("valve_ctl");
        assert_eq!(
            v.validate(&own, |_| true),
            Err(ManifestError::SelfDependency)
        );
    }

    #[test]
    fn test_integrity_hash() {
        let v = validator(false);
        let sealed = manifest().seal().unwrap();
        assert!(v.validate(&sealed, |_| true).is_ok());

        // 封印後の権限変更は検出される
        let tampered = sealed.with_permission("valve", PermissionLevel::Exclusive);
        assert!(matches!(
            v.validate(&tampered, |_| true),
            Err(ManifestError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn test_hardened_requires_signature() {
        let v = validator(true);
        assert_eq!(
            v.validate(&manifest(), |_| true),
            Err(ManifestError::MissingSignature)
        );

        let signed = manifest().sign_with(&key_pair()).unwrap();
        assert!(v.validate(&signed, |_| true).is_ok());
    }

    #[test]
    fn test_tampered_signature_rejected_in_any_mode() {
        let signed = manifest().sign_with(&key_pair()).unwrap();
        let mut tampered = signed.clone();
        tampered.author = "mallory".to_string();

        for hardened in [false, true] {
            assert!(matches!(
                validator(hardened).validate(&tampered, |_| true),
                Err(ManifestError::InvalidSignature(_))
            ));
        }
    }

    #[test]
    fn test_zone_change_after_signing_rejected() {
        let signed = manifest()
            .with_zone("zone2")
            .sign_with(&key_pair())
            .unwrap();
        let v = validator(true);
        assert!(v.validate(&signed, |_| true).is_ok());

        let mut moved = signed.clone();
        moved.zone = Some("zone1".to_string());
        assert!(matches!(
            v.validate(&moved, |_| true),
            Err(ManifestError::InvalidSignature(_))
        ));

        let mut unzoned = signed;
        unzoned.zone = None;
        assert!(matches!(
            v.validate(&unzoned, |_| true),
            Err(ManifestError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_signature_without_key_rejected() {
        let mut m = manifest().sign_with(&key_pair()).unwrap();
        m.public_key = None;
        assert!(matches!(
            validator(false).validate(&m, |_| true),
            Err(ManifestError::InvalidSignature(_))
        ));
        assert_eq!(
            validator(true).validate(&m, |_| true),
            Err(ManifestError::MissingSignature)
        );
    }

    #[test]
    fn test_trusted_keys() {
        let trusted = key_pair();
        let v = ManifestValidator::new(ValidatorConfig {
            hardened: true,
            trusted_keys: vec![BASE64_STANDARD.encode(trusted.public_key().as_ref())],
            ..Default::default()
        })
        .unwrap();

        let good = manifest().sign_with(&trusted).unwrap();
        assert!(v.validate(&good, |_| true).is_ok());

        let stranger = manifest().sign_with(&key_pair()).unwrap();
        assert_eq!(
            v.validate(&stranger, |_| true),
            Err(ManifestError::UntrustedKey)
        );
    }

    #[test]
    fn test_bad_min_version_config() {
        let result = ManifestValidator::new(ValidatorConfig {
            min_version: "1.x".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
