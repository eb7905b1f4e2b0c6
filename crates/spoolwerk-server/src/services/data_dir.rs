// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::{Path, PathBuf};

use spoolwerk_core::error::Result;

const APP_DIR: &str = "spoolwerk";

/// Name of the optional configuration file inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Pick the data directory: explicit choice first, then the XDG location.
pub fn resolve(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(dir) => dir.to_path_buf(),
        None => platform_base(
            std::env::var_os("XDG_DATA_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        )
        .join(APP_DIR),
    }
}

/// Create `dir` if needed.
pub fn ensure(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

fn platform_base(xdg: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(xdg) = xdg.filter(|p| !p.as_os_str().is_empty()) {
        return xdg;
    }
    if let Some(home) = home {
        return home.join(".local").join("share");
    }
    // Last resort
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directory_wins() {
        let dir = Path::new("/srv/spool");
        assert_eq!(resolve(Some(dir)), PathBuf::from("/srv/spool"));
    }

    #[test]
    fn xdg_takes_precedence_over_home() {
        let base = platform_base(Some("/xdg".into()), Some("/home/ada".into()));
        assert_eq!(base, PathBuf::from("/xdg"));
    }

    #[test]
    fn empty_xdg_falls_back_to_home() {
        let base = platform_base(Some(PathBuf::new()), Some("/home/ada".into()));
        assert_eq!(base, PathBuf::from("/home/ada/.local/share"));
    }

    #[test]
    fn ensure_creates_nested_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("a").join("b");
        ensure(&nested).expect("ensure");
        assert!(nested.is_dir());
    }
}
