//! Path confinement and directory hardening for the staging area.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::StageError;

/// Marker written into every freshly created staging directory.
pub const MARKER_FILE: &str = ".htaccess";

/// Prefix of in-progress files inside the staging tree. Never served.
pub const PART_PREFIX: &str = ".part-";

const MARKER_CONTENTS: &str = "# Don't list directory contents
IndexIgnore *
# Disable script execution
AddHandler cgi-script .php .pl .jsp .asp .sh .cgi
Options -ExecCGI -Indexes
";

#[cfg(unix)]
const DIR_MODE: u32 = 0o755;

/// Reduce a user-supplied name to its final path component.
///
/// Both `/` and `\` count as separators. Returns `None` when nothing usable is
/// left (empty, `.`, `..`, or a name containing NUL).
pub fn secure_name(name: &str) -> Option<&str> {
    let base = name
        .rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())?;
    match base {
        "." | ".." => None,
        _ if base.contains('\0') => None,
        _ => Some(base),
    }
}

/// Names the staging tree keeps for itself; an upload may not use them.
pub fn is_reserved_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(MARKER_FILE) || name.starts_with(PART_PREFIX)
}

/// Join the basename of `relative` onto `root`.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, StageError> {
    let name = secure_name(relative)
        .ok_or_else(|| StageError::Validation(format!("unusable file name '{relative}'")))?;
    Ok(root.join(name))
}

/// Create `path` and its parents if missing. Returns `true` only when this
/// call created the directory.
pub fn ensure_dir(path: &Path) -> io::Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }

    // Parents may race freely; only the final component decides who created it.
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        dir_builder(true).create(parent)?;
    }

    match dir_builder(false).create(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(e) => Err(e),
    }
}

fn dir_builder(recursive: bool) -> fs::DirBuilder {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(recursive);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder
}

/// Write the access marker that disables listing and script execution.
pub fn write_protective_marker(dir: &Path) -> io::Result<()> {
    fs::write(dir.join(MARKER_FILE), MARKER_CONTENTS)
}

/// Create a directory and protect it. Directories that already existed are
/// assumed to be protected and are left untouched.
pub fn ensure_secure_dir(path: &Path) -> io::Result<bool> {
    let created = ensure_dir(path)?;
    if created {
        write_protective_marker(path)?;
        tracing::debug!(path = %path.display(), "Created protected directory");
    }
    Ok(created)
}

/// Narrow a written file's mode to the read/write bits of its directory,
/// dropping every execute bit.
#[cfg(unix)]
pub fn restrict_permissions(file: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let mode = fs::metadata(dir)?.permissions().mode() & 0o666;
    fs::set_permissions(file, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn restrict_permissions(_file: &Path) -> io::Result<()> {
    Ok(())
}
