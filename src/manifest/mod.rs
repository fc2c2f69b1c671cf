//! プラグインマニフェスト
//!
//! マニフェストの型定義と、登録前の検証を提供する。

mod types;
mod validator;

pub use types::PluginManifest;
pub use validator::{parse_version, ManifestValidator, Version};
