use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use sner_core::errors::SnerResult;

fn lastrun_path(var_dir: &Path, name: &str) -> PathBuf {
    var_dir.join(format!("{name}.lastrun"))
}

/// True when the named pipeline should run according to its interval.
pub fn should_run(var_dir: &Path, name: &str, interval_seconds: u64) -> bool {
    let path = lastrun_path(var_dir, name);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return true;
    };
    let Ok(lastrun) = DateTime::parse_from_rfc3339(text.trim()) else {
        return true;
    };
    (Utc::now() - lastrun.with_timezone(&Utc)).num_seconds() >= interval_seconds as i64
}

/// Stamp the named pipeline's lastrun file with the current time.
pub fn update_lastrun(var_dir: &Path, name: &str) -> SnerResult<()> {
    std::fs::create_dir_all(var_dir)?;
    std::fs::write(lastrun_path(var_dir, name), Utc::now().to_rfc3339())?;
    Ok(())
}
