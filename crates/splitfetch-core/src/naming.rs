//! File naming for partial and finished downloads

use splitfetch_types::TransferConfig;
use std::path::{Path, PathBuf};

/// Give up probing for a free name after this many candidates
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// Partial file path for a run.
///
/// Resumable runs always use `{base}{ext}.{size}.part` so a later run finds
/// the same file. Other runs take the first candidate that does not exist,
/// counting `{base}{ext}.{size}(1).part`, `(2)` and so on.
pub fn partial_path(config: &TransferConfig, file_size: Option<i64>, resume: bool) -> PathBuf {
    let stem = format!("{}.{}", config.file_name(), file_size.unwrap_or(0));
    let first = config.directory.join(format!("{}.part", stem));
    if resume {
        return first;
    }

    first_free(first, |n| config.directory.join(format!("{}({}).part", stem, n)))
}

/// First of `{base}{ext}`, `{base}(1){ext}`, ... that does not exist in `directory`
pub fn unique_destination(directory: &Path, base_name: &str, extension: &str) -> PathBuf {
    let first = directory.join(format!("{}{}", base_name, extension));
    first_free(first, |n| directory.join(format!("{}({}){}", base_name, n, extension)))
}

fn first_free(first: PathBuf, candidate: impl Fn(u32) -> PathBuf) -> PathBuf {
    let mut path = first;
    let mut counter = 1;

    while path.exists() {
        path = candidate(counter);
        counter += 1;

        if counter > MAX_NAME_ATTEMPTS {
            break;
        }
    }

    path
}
