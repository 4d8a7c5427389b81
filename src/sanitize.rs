//! 文件名校验与上传目录内的路径解析。

use std::fmt;
use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};

use crate::config::{ALLOWED_EXTENSIONS, MAX_FILENAME_LEN};

/// Characters that never appear in a name this service writes.
const FORBIDDEN_CHARS: [char; 11] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0', '\''];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameRejection {
    Empty,
    TooLong,
    ForbiddenCharacters,
    InvalidLeadingCharacter,
    DisallowedExtension,
}

impl FilenameRejection {
    pub fn reason(self) -> &'static str {
        match self {
            FilenameRejection::Empty => "filename is empty",
            FilenameRejection::TooLong => "filename is longer than 255 characters",
            FilenameRejection::ForbiddenCharacters => "filename contains forbidden characters",
            FilenameRejection::InvalidLeadingCharacter => {
                "filename must start with a letter or digit"
            }
            FilenameRejection::DisallowedExtension => "file extension is not allowed",
        }
    }
}

impl fmt::Display for FilenameRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// A filename that passed every rule of [`validate_filename`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedFilename<'a>(&'a str);

impl<'a> ValidatedFilename<'a> {
    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

/// 按顺序校验长度、字符集、首字符与扩展名。
pub fn validate_filename(name: &str) -> Result<ValidatedFilename<'_>, FilenameRejection> {
    if name.is_empty() {
        return Err(FilenameRejection::Empty);
    }
    if name.chars().count() > MAX_FILENAME_LEN {
        return Err(FilenameRejection::TooLong);
    }
    if name.contains("..")
        || name
            .chars()
            .any(|c| FORBIDDEN_CHARS.contains(&c) || c.is_control())
    {
        return Err(FilenameRejection::ForbiddenCharacters);
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(FilenameRejection::InvalidLeadingCharacter);
    }
    let allowed = extension_of(name).is_some_and(|ext| {
        ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    });
    if !allowed {
        return Err(FilenameRejection::DisallowedExtension);
    }
    Ok(ValidatedFilename(name))
}

fn extension_of(name: &str) -> Option<&str> {
    Path::new(name).extension().and_then(|ext| ext.to_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    Unresolvable,
    Traversal,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathError::Unresolvable => f.write_str("cannot resolve path"),
            PathError::Traversal => f.write_str("path escapes the upload directory"),
        }
    }
}

/// An absolute path known to sit strictly inside its base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath(PathBuf);

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// 将文件名解析到基础目录下，并校验结果仍位于该目录之内。
pub fn resolve_safe_path(name: &str, base_dir: &Path) -> Result<ResolvedPath, PathError> {
    let base = normalize(base_dir)?;
    let target = normalize(&base.join(name))?;

    let mut prefix = base.to_str().ok_or(PathError::Unresolvable)?.to_string();
    if !prefix.ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR);
    }
    let target_str = target.to_str().ok_or(PathError::Unresolvable)?;
    if !target_str.starts_with(&prefix) {
        return Err(PathError::Traversal);
    }
    Ok(ResolvedPath(target))
}

fn normalize(path: &Path) -> Result<PathBuf, PathError> {
    let absolute = std::path::absolute(path).map_err(|_| PathError::Unresolvable)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                normalized.push(component.as_os_str())
            }
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
        }
    }
    Ok(normalized)
}
