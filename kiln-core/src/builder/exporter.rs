//! Exporters: turn a finished build into an artifact.
//!
//! [`OciLayoutExporter`] writes an OCI image layout (`oci-layout`,
//! `index.json`, `blobs/sha256/...`) for the image, local, oci and multiarch
//! outputs, and a tar of that layout for the tar output.

use crate::builder::cache::hash::sha256_hex;
use crate::config::{BuildConfig, OutputFormat};
use crate::error::{KilnError, Result};
use crate::types::{BuildResult, Platform};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Produces the final artifact of a build.
pub trait Exporter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Exports `result` into `destination`.
    ///
    /// `work_dir` holds per-platform scratch output under
    /// `<os_arch[_variant]>/`. Returns the path of the written artifact.
    fn export(
        &self,
        result: &BuildResult,
        config: &BuildConfig,
        work_dir: &Path,
        destination: &Path,
    ) -> Result<PathBuf>;
}

/// A content descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<DescriptorPlatform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl From<&Platform> for DescriptorPlatform {
    fn from(p: &Platform) -> Self {
        Self { os: p.os.clone(), architecture: p.architecture.clone(), variant: p.variant.clone() }
    }
}

/// An OCI image index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// An OCI image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Checks the compliance rules for an exported index.
///
/// Schema version 2, at least one manifest, and platform fields on every
/// entry when the index names more than one image.
pub fn validate_index(index: &ImageIndex) -> Result<()> {
    let fail = |reason: String| Err(KilnError::ExportFailed { reason });

    if index.schema_version != 2 {
        return fail(format!("index schemaVersion is {}, expected 2", index.schema_version));
    }
    if index.manifests.is_empty() {
        return fail("index has no manifests".to_string());
    }
    for manifest in &index.manifests {
        if !manifest.digest.starts_with("sha256:") || manifest.digest.len() != 71 {
            return fail(format!("malformed digest {}", manifest.digest));
        }
        match &manifest.platform {
            Some(p) if p.os.is_empty() || p.architecture.is_empty() => {
                return fail(format!("manifest {} has an incomplete platform", manifest.digest));
            }
            None if index.manifests.len() > 1 => {
                return fail(format!("manifest {} in a multi-arch index lacks a platform", manifest.digest));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Writes OCI image layouts.
#[derive(Debug, Default, Clone)]
pub struct OciLayoutExporter;

impl OciLayoutExporter {
    pub fn new() -> Self {
        Self
    }

    fn write_layout(&self, result: &BuildResult, config: &BuildConfig, work_dir: &Path, layout: &Path) -> Result<ImageIndex> {
        let blobs = layout.join("blobs").join("sha256");
        fs::create_dir_all(&blobs).map_err(|e| KilnError::Io { path: blobs.clone(), source: e })?;
        write_file(&layout.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)?;

        let mut manifests = Vec::new();
        for (name, platform_result) in &result.platform_results {
            let platform: Platform = name.parse().map_err(|e| KilnError::ExportFailed {
                reason: format!("{}", e),
            })?;

            let layer = layer_tar(&work_dir.join(platform.cache_dir_name()).join(crate::builder::executor::ROOTFS_DIR))?;
            let layer_desc = write_blob(&blobs, MEDIA_TYPE_LAYER, &layer)?;

            let mut image_config = json!({
                "architecture": platform.architecture,
                "os": platform.os,
                "config": {
                    "Labels": {
                        "org.opencontainers.image.revision": platform_result.image_id.clone().unwrap_or_default(),
                    },
                },
                "rootfs": { "type": "layers", "diff_ids": [layer_desc.digest] },
            });
            if let Some(variant) = &platform.variant {
                image_config["variant"] = json!(variant);
            }
            let config_desc = write_blob(&blobs, MEDIA_TYPE_CONFIG, &to_json(&image_config)?)?;

            let manifest = ImageManifest {
                schema_version: 2,
                media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
                config: config_desc,
                layers: vec![layer_desc],
            };
            let mut desc = write_blob(&blobs, MEDIA_TYPE_MANIFEST, &to_json(&manifest)?)?;
            desc.platform = Some(DescriptorPlatform::from(&platform));
            if let Some(tag) = config.tags.first() {
                desc.annotations.insert(REF_NAME_ANNOTATION.to_string(), tag.clone());
            }
            debug!(platform = %platform, digest = %desc.digest, "Wrote image manifest");
            manifests.push(desc);
        }

        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_INDEX.to_string()),
            manifests,
        };
        validate_index(&index)?;
        write_file(&layout.join("index.json"), &to_json(&index)?)?;
        Ok(index)
    }
}

impl Exporter for OciLayoutExporter {
    fn name(&self) -> &'static str {
        "oci-layout"
    }

    #[instrument(skip_all, fields(output = config.output.as_str(), destination = %destination.display()))]
    fn export(
        &self,
        result: &BuildResult,
        config: &BuildConfig,
        work_dir: &Path,
        destination: &Path,
    ) -> Result<PathBuf> {
        if result.platform_results.is_empty() {
            return Err(KilnError::ExportFailed { reason: "nothing to export".to_string() });
        }

        match config.output {
            OutputFormat::Tar => {
                let staging = tempfile::tempdir_in(work_dir).map_err(|e| KilnError::Io {
                    path: work_dir.to_path_buf(),
                    source: e,
                })?;
                self.write_layout(result, config, work_dir, staging.path())?;

                let archive = if destination.extension().is_some_and(|e| e == "tar") {
                    destination.to_path_buf()
                } else {
                    destination.join("image.tar")
                };
                if let Some(parent) = archive.parent() {
                    fs::create_dir_all(parent).map_err(|e| KilnError::Io { path: parent.to_path_buf(), source: e })?;
                }
                let file = fs::File::create(&archive).map_err(|e| KilnError::Io { path: archive.clone(), source: e })?;
                let mut builder = tar::Builder::new(file);
                builder
                    .append_dir_all(".", staging.path())
                    .and_then(|_| builder.finish())
                    .map_err(|e| KilnError::Io { path: archive.clone(), source: e })?;
                info!(path = %archive.display(), "Exported image archive");
                Ok(archive)
            }
            OutputFormat::Image | OutputFormat::Local | OutputFormat::Oci | OutputFormat::Multiarch => {
                let index = self.write_layout(result, config, work_dir, destination)?;
                info!(manifests = index.manifests.len(), "Exported OCI layout");
                Ok(destination.to_path_buf())
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| KilnError::ExportFailed { reason: e.to_string() })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| KilnError::Io { path: path.to_path_buf(), source: e })
}

fn write_blob(blobs: &Path, media_type: &str, bytes: &[u8]) -> Result<Descriptor> {
    let hex = sha256_hex(bytes);
    let path = blobs.join(&hex);
    if !path.exists() {
        write_file(&path, bytes)?;
    }
    Ok(Descriptor {
        media_type: media_type.to_string(),
        digest: format!("sha256:{}", hex),
        size: bytes.len() as u64,
        platform: None,
        annotations: BTreeMap::new(),
    })
}

/// Tar of `root`, or an empty archive if it does not exist.
fn layer_tar(root: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);
    if root.is_dir() {
        builder.append_dir_all(".", root).map_err(|e| KilnError::Io { path: root.to_path_buf(), source: e })?;
    }
    builder.into_inner().map_err(|e| KilnError::Io { path: root.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlatformResult;
    use tempfile::TempDir;

    fn result(platforms: &[&str]) -> BuildResult {
        let mut result = BuildResult { success: true, multi_arch: platforms.len() > 1, ..Default::default() };
        for p in platforms {
            result.platform_results.insert(
                p.to_string(),
                PlatformResult { success: true, image_id: Some(format!("sha256:{}", p.len())), ..Default::default() },
            );
        }
        result
    }

    fn read_index(layout: &Path) -> ImageIndex {
        serde_json::from_slice(&fs::read(layout.join("index.json")).unwrap()).unwrap()
    }

    #[test]
    fn test_multiarch_layout() {
        let work = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir_all(work.path().join("linux_arm64/rootfs/0")).unwrap();
        fs::write(work.path().join("linux_arm64/rootfs/0/a.txt"), "aarch64").unwrap();

        let config = BuildConfig { output: OutputFormat::Multiarch, tags: vec!["app:1".into()], ..Default::default() };
        OciLayoutExporter::new()
            .export(&result(&["linux/amd64", "linux/arm64"]), &config, work.path(), out.path())
            .unwrap();

        assert!(out.path().join("oci-layout").exists());
        let index = read_index(out.path());
        assert_eq!(index.schema_version, 2);
        assert_eq!(index.manifests.len(), 2);
        let arches: Vec<_> = index.manifests.iter().map(|m| m.platform.as_ref().unwrap().architecture.as_str()).collect();
        assert_eq!(arches, vec!["amd64", "arm64"]);
        assert_eq!(index.manifests[0].annotations.get(REF_NAME_ANNOTATION).unwrap(), "app:1");

        for desc in &index.manifests {
            let hex = desc.digest.trim_start_matches("sha256:");
            let blob = fs::read(out.path().join("blobs/sha256").join(hex)).unwrap();
            assert_eq!(sha256_hex(&blob), hex);
            let manifest: ImageManifest = serde_json::from_slice(&blob).unwrap();
            assert_eq!(manifest.layers.len(), 1);
        }
    }

    #[test]
    fn test_tar_output() {
        let work = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let config = BuildConfig { output: OutputFormat::Tar, ..Default::default() };

        let archive = OciLayoutExporter::new()
            .export(&result(&["linux/amd64"]), &config, work.path(), out.path())
            .unwrap();
        assert_eq!(archive, out.path().join("image.tar"));

        let mut entries = tar::Archive::new(fs::File::open(&archive).unwrap());
        let names: Vec<String> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("index.json")));
        assert!(names.iter().any(|n| n.ends_with("oci-layout")));
    }

    #[test]
    fn test_validate_index_rules() {
        let desc = |platform: Option<DescriptorPlatform>| Descriptor {
            media_type: MEDIA_TYPE_MANIFEST.into(),
            digest: format!("sha256:{}", "a".repeat(64)),
            size: 1,
            platform,
            annotations: BTreeMap::new(),
        };

        let single = ImageIndex { schema_version: 2, media_type: None, manifests: vec![desc(None)] };
        assert!(validate_index(&single).is_ok());

        let missing = ImageIndex { schema_version: 2, media_type: None, manifests: vec![desc(None), desc(None)] };
        assert!(validate_index(&missing).is_err());

        let old = ImageIndex { schema_version: 1, ..single.clone() };
        assert!(validate_index(&old).is_err());

        let empty = ImageIndex { schema_version: 2, media_type: None, manifests: vec![] };
        assert!(validate_index(&empty).is_err());
    }

    #[test]
    fn test_nothing_to_export() {
        let work = TempDir::new().unwrap();
        let err = OciLayoutExporter::new()
            .export(&BuildResult::default(), &BuildConfig::default(), work.path(), work.path())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Executor);
    }
}
