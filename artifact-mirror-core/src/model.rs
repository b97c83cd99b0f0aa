//! Build and artifact records persisted by the mirror.
//!
//! Builds come in two kinds: builtin builds, keyed by the CI run id, and
//! release builds, keyed by the release tag. An [`Artifact`] is a single file
//! retained from one of them; its [`object_key`] is the only place where the
//! object-store layout is decided, so uploads and signed download links
//! always agree on location.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Key segment that separates compatibility-variant files from default ones.
pub const COMPAT_KEY_SEGMENT: &str = "wow64";

/// A bare file name. Never contains a path separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(Error::InvalidArtifactName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ArtifactName> for String {
    fn from(value: ArtifactName) -> Self {
        value.0
    }
}

impl AsRef<str> for ArtifactName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which build flavour a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Default,
    /// The 32-bit compatibility flavour (wow64).
    Compat,
}

impl Variant {
    pub fn from_compat_flag(is_compat: bool) -> Self {
        if is_compat {
            Variant::Compat
        } else {
            Variant::Default
        }
    }

    pub fn is_compat(self) -> bool {
        matches!(self, Variant::Compat)
    }
}

/// A mirrored CI run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinBuild {
    pub run_id: i64,
    pub commit_sha: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub artifact_count: i64,
    pub has_wow64: bool,
}

/// A mirrored tagged release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBuild {
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub artifact_count: i64,
    pub has_wow64: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Build {
    Builtin(BuiltinBuild),
    Release(ReleaseBuild),
}

impl Build {
    pub fn owner(&self) -> BuildRef {
        match self {
            Build::Builtin(b) => BuildRef::Run(b.run_id),
            Build::Release(b) => BuildRef::Tag(b.tag.clone()),
        }
    }

    pub fn artifact_count(&self) -> i64 {
        match self {
            Build::Builtin(b) => b.artifact_count,
            Build::Release(b) => b.artifact_count,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Build::Builtin(b) => b.created_at,
            Build::Release(b) => b.created_at,
        }
    }
}

/// Identity of the build owning an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BuildRef {
    Run(i64),
    Tag(String),
}

impl fmt::Display for BuildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildRef::Run(id) => write!(f, "run {id}"),
            BuildRef::Tag(tag) => write!(f, "release {tag}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Artifact {
    Builtin {
        run_id: i64,
        name: ArtifactName,
        variant: Variant,
    },
    Release {
        tag: String,
        name: ArtifactName,
        variant: Variant,
    },
}

impl Artifact {
    pub fn name(&self) -> &ArtifactName {
        match self {
            Artifact::Builtin { name, .. } | Artifact::Release { name, .. } => name,
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            Artifact::Builtin { variant, .. } | Artifact::Release { variant, .. } => *variant,
        }
    }

    pub fn owner(&self) -> BuildRef {
        match self {
            Artifact::Builtin { run_id, .. } => BuildRef::Run(*run_id),
            Artifact::Release { tag, .. } => BuildRef::Tag(tag.clone()),
        }
    }
}

/// An artifact row as read back from the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredArtifact {
    pub id: i64,
    #[serde(flatten)]
    pub artifact: Artifact,
}

/// A release tag as a single key segment. `%`, `/` and backslash are
/// percent-encoded, and the empty tag, `.` and `..` are replaced outright, so a
/// tag can never add or fake a key segment.
fn tag_segment(tag: &str) -> String {
    match tag {
        "" => return "%00".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }
    let mut out = String::with_capacity(tag.len());
    for c in tag.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    out
}

/// Object-store key for an artifact.
///
/// `<prefix>/builtin/<run-id>/<name>` and `<prefix>/release/<tag>/<name>`;
/// compatibility files get an extra `wow64/` segment before the name. The tag
/// is encoded so distinct tags always key apart.
pub fn object_key(prefix: &str, artifact: &Artifact) -> String {
    let (kind, owner) = match artifact {
        Artifact::Builtin { run_id, .. } => ("builtin", run_id.to_string()),
        Artifact::Release { tag, .. } => ("release", tag_segment(tag)),
    };

    let mut key = String::new();
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        key.push_str(prefix);
        key.push('/');
    }
    key.push_str(kind);
    key.push('/');
    key.push_str(&owner);
    key.push('/');
    if artifact.variant().is_compat() {
        key.push_str(COMPAT_KEY_SEGMENT);
        key.push('/');
    }
    key.push_str(artifact.name().as_str());
    key
}
