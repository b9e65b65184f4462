use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const ADDON_NAME: &str = "shiba";
pub const SETTINGS_FILE: &str = "settings.yaml";
pub const WORKING_COPY_PREFIX: &str = "locked.";
pub const CLI_NAME: &str = "shiba-cli";

pub fn shiba_root(home: &Path) -> PathBuf {
    home.join(".shiba")
}

pub fn settings_path(home: &Path) -> PathBuf {
    shiba_root(home).join(SETTINGS_FILE)
}

/// Private per-add-on directory holding working copies of locked files.
pub fn working_dir() -> PathBuf {
    std::env::temp_dir().join(ADDON_NAME)
}

/// `locked.<file name>`, or `None` when `source` has no file name.
pub fn working_copy_name(source: &Path) -> Option<OsString> {
    let name = source.file_name()?;
    let mut out = OsString::from(WORKING_COPY_PREFIX);
    out.push(name);
    Some(out)
}

/// Location of the CLI server shipped with the host.
///
/// An explicit override wins; otherwise the executable next to the running
/// binary, then whatever `shiba-cli` resolves to on `PATH`, and finally the
/// bare name.
pub fn resolve_bundled_cli(override_path: Option<&Path>) -> PathBuf {
    if let Some(path) = override_path {
        return path.to_path_buf();
    }

    let file_name = format!("{CLI_NAME}{}", std::env::consts::EXE_SUFFIX);
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = dir.join(&file_name);
        if candidate.exists() {
            return candidate;
        }
    }

    which::which(CLI_NAME).unwrap_or_else(|_| PathBuf::from(file_name))
}
