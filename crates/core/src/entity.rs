//! Remote entity snapshots (spec §3). Immutable once fetched; a tagged
//! variant (`Entity`) dispatches rather than a class hierarchy, per the
//! design note in spec §9.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four levels a template token or a `VirtualNode` binding can be at.
/// Ordered: a higher variant can only be bound once every lower one is
/// reachable from it (spec §4.2's level-introduction-order rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Semester,
    Course,
    Folder,
    File,
}

pub type SemesterId = String;
pub type CourseId = String;
pub type FolderId = String;
pub type FileId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Semester {
    pub id: SemesterId,
    pub title: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub title: String,
    pub number: String,
    pub subtitle: String,
    pub description: String,
    pub group: String,
    pub location: String,
    pub class: String,
    #[serde(rename = "type")]
    pub course_type: String,
    pub type_short: String,
    pub semester_ids: Vec<SemesterId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    pub parent_folder_id: Option<FolderId>,
    pub course_id: CourseId,
    pub child_folder_ids: Vec<FolderId>,
    pub child_file_ids: Vec<FileId>,
}

/// Opaque server-provided version token for a file's bytes, falling back to
/// a `(size, mtime)`-derived token when the remote gives nothing better
/// (spec §3, Glossary "Content-hash").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn from_size_mtime(size: u64, mtime: DateTime<Utc>) -> Self {
        ContentHash(format!("{:x}-{}", size, mtime.timestamp()))
    }

    /// URL-safe form used as a path component in the content cache (spec §4.5).
    pub fn url_safe(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    pub name: String,
    pub description: String,
    pub size: u64,
    pub mime_type: String,
    pub storage: String,
    pub terms: String,
    pub downloads: u64,
    pub content_hash: ContentHash,
    pub download_url: String,
    pub folder_id: FolderId,
}

/// One entry produced by a recursive folder-subtree walk (spec §4.3
/// "Children of a folder-level node"): a file together with the chain of
/// folders from the course's top folder down to (and including) its
/// immediate parent.
#[derive(Debug, Clone)]
pub struct FolderTreeEntry {
    pub file: File,
    pub folder_path: Vec<Folder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entity {
    Semester(Semester),
    Course(Course),
    Folder(Folder),
    File(File),
}

impl Entity {
    pub fn level(&self) -> Level {
        match self {
            Entity::Semester(_) => Level::Semester,
            Entity::Course(_) => Level::Course,
            Entity::Folder(_) => Level::Folder,
            Entity::File(_) => Level::File,
        }
    }

    /// First 8 hex characters of the entity's id, used by the disambiguation
    /// rule (spec §4.3 step 4).
    pub fn id_prefix(&self) -> String {
        let id = match self {
            Entity::Semester(s) => &s.id,
            Entity::Course(c) => &c.id,
            Entity::Folder(f) => &f.id,
            Entity::File(f) => &f.id,
        };
        id.chars().take(8).collect()
    }

    /// Absolute URL of the underlying entity in the web interface
    /// (`studip-fuse.url` xattr, spec §6). studip-fuse does not know the
    /// portal's base URL in the abstract, so this renders a relative path
    /// off of `base_url`.
    pub fn web_url(&self, base_url: &url::Url) -> url::Url {
        let rel = match self {
            Entity::Semester(s) => format!("semester/{}", s.id),
            Entity::Course(c) => format!("course/{}", c.id),
            Entity::Folder(f) => format!("folder/{}", f.id),
            Entity::File(f) => format!("file/{}", f.id),
        };
        base_url.join(&rel).unwrap_or_else(|_| base_url.clone())
    }
}
