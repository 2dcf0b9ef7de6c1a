//! Host queries answered directly by the dispatcher: identity and
//! environment reports, working-directory changes and glob expansion.

use nix::unistd::{getuid, User};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};
use undine_core::{Outbound, UndineError, UndineResult};

/// Build a report for `id`. Fields that cannot be determined are sent empty.
pub fn report(id: &str) -> Outbound {
    let username = current_username().unwrap_or_else(|e| {
        warn!(uuid = %id, error = %e, "user lookup failed");
        String::new()
    });
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(uuid = %id, error = %e, "getcwd failed");
            String::new()
        }
    };
    let environ: BTreeMap<String, String> = std::env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .collect();

    debug!(uuid = %id, username = %username, cwd = %cwd, vars = environ.len(), "report built");
    Outbound::Report {
        id: id.to_string(),
        username,
        cwd,
        environ,
    }
}

fn current_username() -> UndineResult<String> {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => std::env::var("USER")
            .map_err(|_| UndineError::Other(format!("no passwd entry for uid {}", getuid()))),
        Err(e) => Err(UndineError::Other(format!("getpwuid: {e}"))),
    }
}

/// Change the daemon's working directory. Children spawned afterwards
/// inherit it; running children keep their own.
pub fn change_dir(dir: &str) -> UndineResult<()> {
    std::env::set_current_dir(Path::new(dir))?;
    debug!(dir, "working directory changed");
    Ok(())
}

/// Expand `pattern` relative to the working directory.
///
/// Only a malformed pattern is an error; unreadable paths are skipped.
pub fn glob(pattern: &str) -> UndineResult<Vec<String>> {
    let paths = glob::glob(pattern)
        .map_err(|e| UndineError::InvalidMessage(format!("bad pattern {pattern:?}: {e}")))?;
    let mut names = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => names.push(path.to_string_lossy().into_owned()),
            Err(e) => debug!(pattern, error = %e, "glob entry skipped"),
        }
    }
    Ok(names)
}
