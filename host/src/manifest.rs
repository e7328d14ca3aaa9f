//! Rewrites over-broad extras in the backend's dependency manifest.
//!
//! The upstream manifest pulls a text-processing package with every
//! language extra, which drags in large optional toolchains. Only the
//! kept extras are needed, so `misaki[en,ja,ko,zh]` becomes `misaki[en]`
//! and the stale lock file is removed so the package manager re-resolves.

use narrate_core::{HostError, HostResult, ManifestPatchConfig};
use regex::{NoExpand, Regex};
use std::borrow::Cow;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    NoManifest,
    Unchanged,
    Patched { lock_removed: bool },
}

/// Replaces every `<package>[...]` specifier in `content` with `<package>[<keep>]`.
pub fn rewrite_extras<'a>(
    content: &'a str,
    package: &str,
    keep: &[String],
) -> HostResult<Cow<'a, str>> {
    let pattern = format!(r"\b{}\[[^\]\r\n]*\]", regex::escape(package));
    let re = Regex::new(&pattern)
        .map_err(|e| HostError::Manifest(format!("Invalid package pattern {}: {}", pattern, e)))?;
    let replacement = format!("{}[{}]", package, keep.join(","));
    Ok(re.replace_all(content, NoExpand(&replacement)))
}

/// Patches the manifest inside `backend_dir` in place.
///
/// The lock file is only deleted when the manifest content actually changed.
pub fn patch_manifest(backend_dir: &Path, rule: &ManifestPatchConfig) -> HostResult<PatchOutcome> {
    let manifest_path = backend_dir.join(&rule.manifest_file);
    if !manifest_path.is_file() {
        debug!("No manifest at {}", manifest_path.display());
        return Ok(PatchOutcome::NoManifest);
    }

    info!("Patching {}...", manifest_path.display());
    let content = fs::read_to_string(&manifest_path).map_err(|e| {
        HostError::Manifest(format!("Failed to read {}: {}", manifest_path.display(), e))
    })?;

    let patched = rewrite_extras(&content, &rule.package, &rule.keep_features)?;
    if patched == content {
        info!("No patching needed (already patched).");
        return Ok(PatchOutcome::Unchanged);
    }

    fs::write(&manifest_path, patched.as_bytes()).map_err(|e| {
        HostError::Manifest(format!("Failed to write {}: {}", manifest_path.display(), e))
    })?;
    info!("Patching successful.");

    let lock_path = backend_dir.join(&rule.lock_file);
    let lock_removed = if lock_path.exists() {
        fs::remove_file(&lock_path).map_err(|e| {
            HostError::Manifest(format!("Failed to delete {}: {}", lock_path.display(), e))
        })?;
        info!("Deleted {} to force re-resolution.", rule.lock_file);
        true
    } else {
        false
    };

    Ok(PatchOutcome::Patched { lock_removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn keep(features: &[&str]) -> Vec<String> {
        features.iter().map(|s| s.to_string()).collect()
    }

    fn rule() -> ManifestPatchConfig {
        ManifestPatchConfig::default()
    }

    #[test]
    fn test_rewrites_to_kept_feature() {
        let out = rewrite_extras("dep[a,b,c]", "dep", &keep(&["a"])).unwrap();
        assert_eq!(out, "dep[a]");
    }

    #[test]
    fn test_leaves_unrelated_lines_untouched() {
        let content = "dependencies = [\n    \"misaki[en,ja,ko,zh]>=0.7.4\",\n    \"torch[cuda]==2.5\",\n    \"other-misaki-tools\",\n]\n";
        let out = rewrite_extras(content, "misaki", &keep(&["en"])).unwrap();
        assert_eq!(
            out,
            "dependencies = [\n    \"misaki[en]>=0.7.4\",\n    \"torch[cuda]==2.5\",\n    \"other-misaki-tools\",\n]\n"
        );
    }

    #[test]
    fn test_minimal_form_is_unchanged() {
        let content = "\"misaki[en]>=0.7.4\"";
        let out = rewrite_extras(content, "misaki", &keep(&["en"])).unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_replacement_is_literal() {
        let out = rewrite_extras("pkg[x]", "pkg", &keep(&["$1"])).unwrap();
        assert_eq!(out, "pkg[$1]");
    }

    #[test]
    fn test_patch_manifest_removes_lock_when_changed() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\ndependencies = [\"misaki[en,ja,ko,zh]>=0.7.4\"]\n",
        )
        .unwrap();
        fs::write(dir.path().join("uv.lock"), "stale").unwrap();

        let outcome = patch_manifest(dir.path(), &rule()).unwrap();
        assert_eq!(outcome, PatchOutcome::Patched { lock_removed: true });
        assert_eq!(
            fs::read_to_string(dir.path().join("pyproject.toml")).unwrap(),
            "[project]\ndependencies = [\"misaki[en]>=0.7.4\"]\n"
        );
        assert!(!dir.path().join("uv.lock").exists());
    }

    #[test]
    fn test_patch_manifest_is_noop_when_minimal() {
        let dir = tempdir().unwrap();
        let manifest = "[project]\ndependencies = [\"misaki[en]>=0.7.4\"]\n";
        fs::write(dir.path().join("pyproject.toml"), manifest).unwrap();
        fs::write(dir.path().join("uv.lock"), "fresh").unwrap();

        let outcome = patch_manifest(dir.path(), &rule()).unwrap();
        assert_eq!(outcome, PatchOutcome::Unchanged);
        assert_eq!(
            fs::read_to_string(dir.path().join("pyproject.toml")).unwrap(),
            manifest
        );
        assert_eq!(fs::read_to_string(dir.path().join("uv.lock")).unwrap(), "fresh");
    }

    #[test]
    fn test_patch_manifest_without_lock_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("pyproject.toml"), "misaki[en,zh]").unwrap();

        let outcome = patch_manifest(dir.path(), &rule()).unwrap();
        assert_eq!(outcome, PatchOutcome::Patched { lock_removed: false });
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempdir().unwrap();
        assert_eq!(
            patch_manifest(dir.path(), &rule()).unwrap(),
            PatchOutcome::NoManifest
        );
    }
}
