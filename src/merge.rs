use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::PipelineError;

/// Reduce one tool output line to a host name: first whitespace-delimited
/// token with the DNS root label stripped.
pub fn canonical_host(line: &str) -> Option<&str> {
    let token = line.split_whitespace().next()?;
    let token = token.strip_suffix('.').unwrap_or(token);
    (!token.is_empty()).then_some(token)
}

/// Merge line-oriented tool outputs into a sorted, deduplicated host list.
///
/// Unreadable files are skipped with a warning. If nothing usable remains the
/// run cannot continue and [`PipelineError::EmptyUniverse`] is returned.
pub fn merge<P: AsRef<Path>>(files: &[P]) -> Result<Vec<String>, PipelineError> {
    let mut hosts = BTreeSet::new();
    for path in files {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable tool output");
                continue;
            }
        };
        hosts.extend(content.lines().filter_map(canonical_host).map(str::to_string));
    }
    if hosts.is_empty() {
        return Err(PipelineError::EmptyUniverse);
    }
    Ok(hosts.into_iter().collect())
}

/// Merge `files` and write the result to `dest`, one host per line.
pub fn merge_into<P: AsRef<Path>>(files: &[P], dest: &Path) -> Result<Vec<String>, PipelineError> {
    let hosts = merge(files)?;
    write_lines(dest, &hosts)?;
    info!(count = hosts.len(), path = %dest.display(), "merged host list written");
    Ok(hosts)
}

/// Read a host list written by a tool or by [`merge_into`], keeping the
/// first token of every non-blank line in file order.
pub fn read_hosts(path: &Path) -> Result<Vec<String>, PipelineError> {
    let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(content
        .lines()
        .filter_map(canonical_host)
        .map(str::to_string)
        .collect())
}

pub fn write_lines(path: &Path, lines: &[String]) -> Result<(), PipelineError> {
    let mut body = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        body.push_str(line.trim());
        body.push('\n');
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
    }
    fs::write(path, body).map_err(|e| PipelineError::io(path, e))
}

/// Collect the output files of tools that succeeded and actually wrote a file.
pub fn usable_outputs(candidates: impl IntoIterator<Item = (bool, PathBuf)>) -> Vec<PathBuf> {
    candidates
        .into_iter()
        .filter(|(ok, path)| *ok && path.is_file())
        .map(|(_, path)| path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_host_takes_first_token() {
        assert_eq!(canonical_host("a.example.com [A] [1.2.3.4]"), Some("a.example.com"));
        assert_eq!(canonical_host("  b.example.com.  "), Some("b.example.com"));
        assert_eq!(canonical_host("   "), None);
        assert_eq!(canonical_host("."), None);
    }

    #[test]
    fn merge_is_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("one.txt");
        fs::write(&f, "A.example.com\na.example.com\n").unwrap();
        let hosts = merge(&[f]).unwrap();
        assert_eq!(hosts, vec!["A.example.com", "a.example.com"]);
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        fs::write(&good, "x.example.com\n").unwrap();
        let hosts = merge(&[dir.path().join("nope.txt"), good]).unwrap();
        assert_eq!(hosts, vec!["x.example.com"]);
    }

    #[test]
    fn blank_inputs_are_an_empty_universe() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("blank.txt");
        fs::write(&f, "\n  \n.\n").unwrap();
        let err = merge(&[f]).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyUniverse));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn usable_outputs_requires_success_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        fs::write(&present, "h\n").unwrap();
        let out = usable_outputs(vec![
            (true, present.clone()),
            (false, present.clone()),
            (true, dir.path().join("absent.txt")),
        ]);
        assert_eq!(out, vec![present]);
    }
}
