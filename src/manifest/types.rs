//! Plugin Manifest Types
//!
//! プラグインマニフェストと正規エンコーディング

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::permission::{PermissionDecl, PermissionLevel};

/// プラグインマニフェスト
///
/// 登録成功時に丸ごと置き換えられ、部分的に変更されることはない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// プラグインID（`^[a-z0-9_]+$`）
    pub plugin_id: String,
    /// 表示名
    pub name: String,
    /// セマンティックバージョン
    pub version: String,
    /// 作成者
    pub author: String,
    /// 必須権限（`capability:level`）
    #[serde(default)]
    pub required_permissions: Vec<PermissionDecl>,
    /// 任意権限
    #[serde(default)]
    pub optional_permissions: Vec<PermissionDecl>,
    /// 依存プラグインID
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 所属ゾーン（None ならすべてのゾーンでローカル扱い）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Ed25519 署名（base64）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Ed25519 公開鍵（base64）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// 正規エンコーディングの SHA-256（16進小文字）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
}

/// ハッシュと署名の対象となるフィールド
#[derive(Serialize)]
struct CanonicalManifest<'a> {
    id: &'a str,
    version: &'a str,
    author: &'a str,
    permissions: Vec<String>,
    dependencies: Vec<&'a str>,
}

/// 署名の対象（正規フィールドに所属ゾーンを加える）
#[derive(Serialize)]
struct SignedManifest<'a> {
    #[serde(flatten)]
    canonical: CanonicalManifest<'a>,
    zone: Option<&'a str>,
}

impl PluginManifest {
    pub fn new(
        plugin_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            name: name.into(),
            version: version.into(),
            author: author.into(),
            required_permissions: Vec::new(),
            optional_permissions: Vec::new(),
            dependencies: Vec::new(),
            zone: None,
            signature: None,
            public_key: None,
            integrity_hash: None,
        }
    }

    pub fn with_permission(mut self, capability: &str, level: PermissionLevel) -> Self {
        self.required_permissions
            .push(PermissionDecl::new(capability, level));
        self
    }

    pub fn with_optional_permission(mut self, capability: &str, level: PermissionLevel) -> Self {
        self.optional_permissions
            .push(PermissionDecl::new(capability, level));
        self
    }

    pub fn with_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.dependencies.push(plugin_id.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// 必須・任意を合わせた宣言済み権限
    pub fn permissions(&self) -> impl Iterator<Item = &PermissionDecl> {
        self.required_permissions
            .iter()
            .chain(self.optional_permissions.iter())
    }

    /// ケイパビリティに対する実効レベル（宣言の最大値）
    pub fn effective_level(&self, capability: &str) -> Option<PermissionLevel> {
        self.permissions()
            .filter(|decl| decl.covers(capability))
            .map(|decl| decl.level)
            .max()
    }

    /// FEDERATE 権限を宣言しているか
    pub fn can_federate(&self) -> bool {
        self.permissions()
            .any(|decl| decl.level == PermissionLevel::Federate)
    }

    /// 正規エンコーディング（ソート済み権限名・依存関係の JSON）
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.canonical())?)
    }

    /// 署名対象のエンコーディング。ゾーンの書き換えも検出する
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let signed = SignedManifest {
            canonical: self.canonical(),
            zone: self.zone.as_deref(),
        };
        Ok(serde_json::to_vec(&signed)?)
    }

    fn canonical(&self) -> CanonicalManifest<'_> {
        let mut permissions: Vec<String> = self.permissions().map(|p| p.to_string()).collect();
        permissions.sort();
        permissions.dedup();

        let mut dependencies: Vec<&str> = self.dependencies.iter().map(String::as_str).collect();
        dependencies.sort_unstable();
        dependencies.dedup();

        CanonicalManifest {
            id: &self.plugin_id,
            version: &self.version,
            author: &self.author,
            permissions,
            dependencies,
        }
    }

    /// 正規エンコーディングの SHA-256
    pub fn compute_integrity_hash(&self) -> Result<String> {
        let digest = Sha256::digest(self.canonical_bytes()?);
        Ok(format!("{:x}", digest))
    }

    /// 整合性ハッシュを埋め込む
    pub fn seal(mut self) -> Result<Self> {
        self.integrity_hash = Some(self.compute_integrity_hash()?);
        Ok(self)
    }

    /// 署名対象のエンコーディングに署名し、公開鍵と署名を埋め込む
    pub fn sign_with(mut self, key_pair: &Ed25519KeyPair) -> Result<Self> {
        let signature = key_pair.sign(&self.signing_bytes()?);
        self.public_key = Some(BASE64_STANDARD.encode(key_pair.public_key().as_ref()));
        self.signature = Some(BASE64_STANDARD.encode(signature.as_ref()));
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PluginManifest {
        PluginManifest::new("greenhouse_ctl", "Greenhouse Control", "1.2.0", "ops")
            .with_permission("valve", PermissionLevel::Control)
            .with_permission("*", PermissionLevel::Monitor)
            .with_optional_permission("pump", PermissionLevel::Actuate)
    }

    #[test]
    fn test_effective_level_takes_maximum() {
        let manifest = sample();
        assert_eq!(
            manifest.effective_level("valve"),
            Some(PermissionLevel::Control)
        );
        assert_eq!(
            manifest.effective_level("pump"),
            Some(PermissionLevel::Actuate)
        );
        assert_eq!(
            manifest.effective_level("humidity"),
            Some(PermissionLevel::Monitor)
        );
        assert!(!manifest.can_federate());
    }

    #[test]
    fn test_canonical_encoding_ignores_declaration_order() {
        let a = sample().with_dependency("b_dep").with_dependency("a_dep");
        let mut b = PluginManifest::new("greenhouse_ctl", "Other Name", "1.2.0", "ops")
            .with_optional_permission("pump", PermissionLevel::Actuate)
            .with_permission("*", PermissionLevel::Monitor)
            .with_permission("valve", PermissionLevel::Control)
            .with_dependency("a_dep")
            .with_dependency("b_dep");
        b.zone = Some("zone1".to_string());

        // 表示名とゾーンは正規エンコーディングに含まれない
        assert_eq!(
            a.compute_integrity_hash().unwrap(),
            b.compute_integrity_hash().unwrap()
        );
    }

    #[test]
    fn test_hash_changes_with_permissions() {
        let a = sample();
        let b = sample().with_permission("valve", PermissionLevel::Exclusive);
        assert_ne!(
            a.compute_integrity_hash().unwrap(),
            b.compute_integrity_hash().unwrap()
        );
    }

    #[test]
    fn test_manifest_from_toml() {
        let manifest: PluginManifest = toml::from_str(
            r#"
plugin_id = "irrigation"
name = "Irrigation"
version = "0.3.1"
author = "farm"
required_permissions = ["valve:actuate", "moisture:read"]
dependencies = ["weather"]
zone = "greenhouse_a"
"#,
        )
        .unwrap();
        assert_eq!(
            manifest.effective_level("valve"),
            Some(PermissionLevel::Actuate)
        );
        assert_eq!(manifest.dependencies, vec!["weather".to_string()]);
        assert_eq!(manifest.zone.as_deref(), Some("greenhouse_a"));
    }
}
