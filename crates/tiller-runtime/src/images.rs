//! Deterministic sandbox-image keying.
//!
//! A runtime either uses a prebuilt image tag verbatim or derives a layered
//! build from a base image. Derived tags are keyed by (runtime version,
//! dependency lock hash, source hash); identical inputs always produce
//! byte-identical tags, which is what makes layer reuse sound.

use sha2::{Digest, Sha256};

const HASH_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInputs {
    pub runtime_version: String,
    pub base_image: String,
    /// Contents of dependency lock files, in a stable order. Empty when no
    /// lock files exist; the empty input still hashes to a stable key.
    pub lock_contents: Vec<Vec<u8>>,
    /// Contents of the runtime source tree, in a stable order.
    pub source_contents: Vec<Vec<u8>>,
    pub extra_deps: Option<String>,
    pub platform: Option<String>,
}

/// The three tags of the layer ladder, most specific first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTags {
    /// Keyed by version + base + lock hash + source hash.
    pub source: String,
    /// Keyed by version + base + lock hash.
    pub lock: String,
    /// Keyed by version + base only.
    pub versioned: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPlan {
    /// A source-exact image exists; use it verbatim.
    Reuse { tag: String },
    /// Deps layer exists; rebuild only the source layer.
    RebuildSource { from: String, target: String },
    /// Versioned base layer exists; rebuild deps and source.
    RebuildDeps { from: String, target: String },
    /// Nothing reusable; build every layer from the base image.
    BuildFromScratch { base: String, target: String },
}

impl BuildPlan {
    pub fn target_tag(&self) -> &str {
        match self {
            BuildPlan::Reuse { tag } => tag,
            BuildPlan::RebuildSource { target, .. }
            | BuildPlan::RebuildDeps { target, .. }
            | BuildPlan::BuildFromScratch { target, .. } => target,
        }
    }
}

pub fn lock_hash(inputs: &ImageInputs) -> String {
    let mut hasher = Sha256::new();
    for content in &inputs.lock_contents {
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(content);
    }
    if let Some(extra) = &inputs.extra_deps {
        hasher.update(extra.as_bytes());
    }
    hex_digest(hasher)
}

pub fn source_hash(inputs: &ImageInputs) -> String {
    let mut hasher = Sha256::new();
    for content in &inputs.source_contents {
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(content);
    }
    hex_digest(hasher)
}

pub fn derive_tags(inputs: &ImageInputs) -> ImageTags {
    let base_slug = slugify(&inputs.base_image);
    let platform = inputs
        .platform
        .as_deref()
        .map(slugify)
        .map(|p| format!("_{p}"))
        .unwrap_or_default();
    let prefix = format!(
        "tiller-runtime:{}{}_{}",
        inputs.runtime_version, platform, base_slug
    );
    let lock = lock_hash(inputs);
    let source = source_hash(inputs);
    ImageTags {
        source: format!("{prefix}_lock_{lock}_src_{source}"),
        lock: format!("{prefix}_lock_{lock}"),
        versioned: prefix,
    }
}

/// The reuse ladder: exact source match, then lock match, then versioned
/// base, then a scratch build from the configured base image.
pub fn plan_build<F>(inputs: &ImageInputs, image_exists: F) -> BuildPlan
where
    F: Fn(&str) -> bool,
{
    let tags = derive_tags(inputs);
    if image_exists(&tags.source) {
        return BuildPlan::Reuse { tag: tags.source };
    }
    if image_exists(&tags.lock) {
        return BuildPlan::RebuildSource {
            from: tags.lock,
            target: tags.source,
        };
    }
    if image_exists(&tags.versioned) {
        return BuildPlan::RebuildDeps {
            from: tags.versioned,
            target: tags.source,
        };
    }
    BuildPlan::BuildFromScratch {
        base: inputs.base_image.clone(),
        target: tags.source,
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest.iter() {
        if out.len() >= HASH_LEN {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(HASH_LEN);
    out
}

fn slugify(image: &str) -> String {
    image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> ImageInputs {
        ImageInputs {
            runtime_version: "0.1.0".to_string(),
            base_image: "ubuntu:24.04".to_string(),
            lock_contents: vec![b"lockfile-a".to_vec()],
            source_contents: vec![b"fn main() {}".to_vec()],
            extra_deps: None,
            platform: None,
        }
    }

    #[test]
    fn identical_inputs_produce_identical_tags() {
        assert_eq!(derive_tags(&inputs()), derive_tags(&inputs()));
    }

    #[test]
    fn source_change_moves_only_the_source_tag() {
        let a = derive_tags(&inputs());
        let mut changed = inputs();
        changed.source_contents = vec![b"fn main() { panic!() }".to_vec()];
        let b = derive_tags(&changed);
        assert_ne!(a.source, b.source);
        assert_eq!(a.lock, b.lock);
        assert_eq!(a.versioned, b.versioned);
    }

    #[test]
    fn lock_change_moves_lock_and_source_tags() {
        let a = derive_tags(&inputs());
        let mut changed = inputs();
        changed.lock_contents = vec![b"lockfile-b".to_vec()];
        let b = derive_tags(&changed);
        assert_ne!(a.source, b.source);
        assert_ne!(a.lock, b.lock);
        assert_eq!(a.versioned, b.versioned);
    }

    #[test]
    fn missing_lock_files_still_key_deterministically() {
        let mut no_lock = inputs();
        no_lock.lock_contents = Vec::new();
        let a = derive_tags(&no_lock);
        let b = derive_tags(&no_lock);
        assert_eq!(a, b);
        assert_ne!(a.lock, derive_tags(&inputs()).lock);
    }

    #[test]
    fn reuse_ladder_prefers_most_specific_layer() {
        let inputs = inputs();
        let tags = derive_tags(&inputs);

        let plan = plan_build(&inputs, |tag| tag == tags.source);
        assert_eq!(plan, BuildPlan::Reuse { tag: tags.source.clone() });

        let plan = plan_build(&inputs, |tag| tag == tags.lock);
        assert_eq!(
            plan,
            BuildPlan::RebuildSource {
                from: tags.lock.clone(),
                target: tags.source.clone(),
            }
        );

        let plan = plan_build(&inputs, |tag| tag == tags.versioned);
        assert_eq!(
            plan,
            BuildPlan::RebuildDeps {
                from: tags.versioned.clone(),
                target: tags.source.clone(),
            }
        );

        let plan = plan_build(&inputs, |_| false);
        assert_eq!(
            plan,
            BuildPlan::BuildFromScratch {
                base: "ubuntu:24.04".to_string(),
                target: tags.source,
            }
        );
    }

    #[test]
    fn tags_are_registry_safe() {
        let mut odd = inputs();
        odd.base_image = "ghcr.io/acme/dev image:latest".to_string();
        odd.platform = Some("linux/amd64".to_string());
        let tags = derive_tags(&odd);
        assert!(!tags.source.contains(' '));
        assert!(!tags.source.contains('/') || tags.source.starts_with("tiller-runtime:"));
    }
}
