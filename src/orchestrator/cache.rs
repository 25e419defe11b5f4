//! Per-task file cache and patch/diff/syntax-check operations (§4.7).
//!
//! Operates directly on a [`Task`]'s `file_cache` map; no locking of its own,
//! per §5's "the per-task `file_cache` is accessed only by its own control
//! thread; no locking needed" — callers already hold the task's lock.
//!
//! `diffy` backs the unified-diff apply/diff operations; `regex` backs
//! regex-replace. Both are reached for because the reference codebase's
//! sibling crates in the same workspace depend on them for exactly this kind
//! of text patching.

use super::error::OrchestratorError;
use super::task::Task;
use regex::Regex;
use std::process::Command as ProcessCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    UnifiedDiff,
    RegexReplace,
    RangeReplace,
}

/// Result of a successful patch application.
pub struct PatchOutcome {
    pub diff: String,
    pub new_size: usize,
    pub notes: String,
}

/// Reads a path from the task's cache.
pub fn read_cache<'a>(task: &'a Task, path: &str) -> Result<&'a str, OrchestratorError> {
    task.file_cache
        .get(path)
        .map(|s| s.as_str())
        .ok_or_else(|| OrchestratorError::ValidationError { detail: format!("{} is not cached", path) })
}

/// Overwrites (or creates) a cached entry. The first content ever written for
/// a path is retained separately as its "original" for `diff-cache`.
pub fn write_cache(task: &mut Task, path: &str, content: String) {
    task.file_cache_original.entry(path.to_string()).or_insert_with(|| content.clone());
    task.file_cache.insert(path.to_string(), content);
}

/// Applies a patch to the cached content at `path`.
///
/// On `dry_run`, the cache is left untouched and only the would-be diff is returned.
pub fn patch_cache(
    task: &mut Task,
    path: &str,
    patch: &str,
    format: PatchFormat,
    dry_run: bool,
) -> Result<PatchOutcome, OrchestratorError> {
    let before = task
        .file_cache
        .get(path)
        .cloned()
        .ok_or_else(|| OrchestratorError::ValidationError { detail: format!("{} is not cached", path) })?;

    let after = match format {
        PatchFormat::UnifiedDiff => apply_unified_diff(&before, patch)?,
        PatchFormat::RegexReplace => apply_regex_replace(&before, patch)?,
        PatchFormat::RangeReplace => apply_range_replace(&before, patch)?,
    };

    let diff = diffy::create_patch(&before, &after).to_string();
    let new_size = after.len();

    if dry_run {
        return Ok(PatchOutcome { diff, new_size, notes: "dry run: cache left unmodified".to_string() });
    }

    task.file_cache.insert(path.to_string(), after);
    Ok(PatchOutcome { diff, new_size, notes: "patch applied".to_string() })
}

fn apply_unified_diff(before: &str, patch_text: &str) -> Result<String, OrchestratorError> {
    let patch = diffy::Patch::from_str(patch_text)
        .map_err(|e| OrchestratorError::ValidationError { detail: format!("invalid unified diff: {}", e) })?;
    diffy::apply(before, &patch)
        .map_err(|e| OrchestratorError::ValidationError { detail: format!("failed to apply diff: {}", e) })
}

/// `pattern|||replacement`, applied with multi-line and dot-all semantics.
fn apply_regex_replace(before: &str, spec: &str) -> Result<String, OrchestratorError> {
    let (pattern, replacement) = spec.split_once("|||").ok_or_else(|| OrchestratorError::ValidationError {
        detail: "regex-replace patch must be 'pattern|||replacement'".to_string(),
    })?;
    let pattern_src = format!("(?ms){}", pattern);
    let re = Regex::new(&pattern_src)
        .map_err(|e| OrchestratorError::ValidationError { detail: format!("invalid regex: {}", e) })?;
    Ok(re.replace_all(before, replacement).into_owned())
}

/// `start,end\n<text>`: replaces `[start,end]` (inclusive, 1-based lines) with `<text>`.
fn apply_range_replace(before: &str, spec: &str) -> Result<String, OrchestratorError> {
    let (header, text) = spec.split_once('\n').ok_or_else(|| OrchestratorError::ValidationError {
        detail: "range-replace patch must be 'start,end\\n<text>'".to_string(),
    })?;
    let (start_s, end_s) = header.split_once(',').ok_or_else(|| OrchestratorError::ValidationError {
        detail: "range-replace header must be 'start,end'".to_string(),
    })?;
    let start: usize = start_s
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::ValidationError { detail: "invalid range start".to_string() })?;
    let end: usize = end_s
        .trim()
        .parse()
        .map_err(|_| OrchestratorError::ValidationError { detail: "invalid range end".to_string() })?;
    if start == 0 || start > end {
        return Err(OrchestratorError::ValidationError { detail: "range start/end out of order".to_string() });
    }

    let lines: Vec<&str> = before.lines().collect();
    if end > lines.len() {
        return Err(OrchestratorError::ValidationError {
            detail: format!("range end {} exceeds file length {}", end, lines.len()),
        });
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    out.extend_from_slice(&lines[..start - 1]);
    let replacement_lines: Vec<&str> = text.lines().collect();
    out.extend(replacement_lines);
    out.extend_from_slice(&lines[end..]);
    Ok(out.join("\n"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAgainst {
    Original,
    Provided,
}

/// Diffs the cached content at `path` against either its first-seen version
/// (tracked in `file_cache_original`) or an explicitly supplied comparison
/// string.
pub fn diff_cache(task: &Task, path: &str, against: DiffAgainst, provided: &str) -> Result<String, OrchestratorError> {
    let current = read_cache(task, path)?;
    let diff = match against {
        DiffAgainst::Original => {
            let original = task
                .file_cache_original
                .get(path)
                .map(|s| s.as_str())
                .ok_or_else(|| OrchestratorError::ValidationError { detail: format!("{} has no tracked original", path) })?;
            diffy::create_patch(original, current)
        }
        DiffAgainst::Provided => diffy::create_patch(provided, current),
    };
    Ok(diff.to_string())
}

/// Invokes an external checker for `path`'s language on the cached content.
///
/// The checker is expected at `checker_path` (e.g. `luacheck`), invoked with a
/// temp file holding the cached content. Exit code 0 is ok; non-zero with
/// stderr is a failure string. If `checker_path` is `None`, the check is
/// skipped with a clear note rather than treated as a failure.
pub fn syntax_check_cache(
    task: &Task,
    path: &str,
    checker_path: Option<&str>,
) -> Result<String, OrchestratorError> {
    let content = read_cache(task, path)?;
    let checker = match checker_path {
        Some(c) => c,
        None => return Ok("syntax check skipped: no checker configured for this file type".to_string()),
    };

    let tmp = tempfile::Builder::new()
        .suffix(extension_of(path))
        .tempfile()
        .map_err(|e| OrchestratorError::ValidationError { detail: format!("failed to create temp file: {}", e) })?;
    std::fs::write(tmp.path(), content)
        .map_err(|e| OrchestratorError::ValidationError { detail: format!("failed to write temp file: {}", e) })?;

    let output = ProcessCommand::new(checker)
        .arg(tmp.path())
        .output()
        .map_err(|e| OrchestratorError::ValidationError { detail: format!("failed to run checker: {}", e) })?;

    if output.status.success() {
        Ok("ok".to_string())
    } else {
        Err(OrchestratorError::ValidationError { detail: String::from_utf8_lossy(&output.stderr).into_owned() })
    }
}

fn extension_of(path: &str) -> &str {
    path.rfind('.').map(|i| &path[i..]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::task::Task;

    fn task_with_cache(path: &str, content: &str) -> Task {
        let mut task = Task::new("t1".into(), "k".into(), "c".into(), "p".into(), vec![], 3, 20);
        write_cache(&mut task, path, content.to_string());
        task
    }

    #[test]
    fn regex_replace_applies_across_whole_content() {
        let mut task = task_with_cache("/a.lua", "prnt('Hi')");
        let outcome =
            patch_cache(&mut task, "/a.lua", "prnt|||print", PatchFormat::RegexReplace, false).unwrap();
        assert_eq!(task.file_cache["/a.lua"], "print('Hi')");
        assert!(outcome.diff.contains("print"));
    }

    #[test]
    fn range_replace_swaps_inclusive_line_range() {
        let mut task = task_with_cache("/a.txt", "one\ntwo\nthree\nfour");
        patch_cache(&mut task, "/a.txt", "2,3\nTWO\nTHREE", PatchFormat::RangeReplace, false).unwrap();
        assert_eq!(task.file_cache["/a.txt"], "one\nTWO\nTHREE\nfour");
    }

    #[test]
    fn dry_run_leaves_cache_untouched() {
        let mut task = task_with_cache("/a.txt", "one\ntwo");
        let before = task.file_cache["/a.txt"].clone();
        patch_cache(&mut task, "/a.txt", "one|||ONE", PatchFormat::RegexReplace, true).unwrap();
        assert_eq!(task.file_cache["/a.txt"], before);
    }

    #[test]
    fn read_uncached_path_is_an_error() {
        let task = task_with_cache("/a.txt", "x");
        assert!(read_cache(&task, "/b.txt").is_err());
    }

    #[test]
    fn syntax_check_without_checker_is_skipped_not_failed() {
        let task = task_with_cache("/a.lua", "print('hi')");
        let result = syntax_check_cache(&task, "/a.lua", None).unwrap();
        assert!(result.contains("skipped"));
    }

    #[test]
    fn diff_against_original_compares_to_first_seen_content() {
        let mut task = task_with_cache("/a.lua", "prnt('Hi')");
        patch_cache(&mut task, "/a.lua", "prnt|||print", PatchFormat::RegexReplace, false).unwrap();

        let diff = diff_cache(&task, "/a.lua", DiffAgainst::Original, "").unwrap();
        assert!(diff.contains("-prnt('Hi')"));
        assert!(diff.contains("+print('Hi')"));
    }

    #[test]
    fn diff_against_original_without_any_cached_content_is_an_error() {
        let mut task = Task::new("t1".into(), "k".into(), "c".into(), "p".into(), vec![], 3, 20);
        task.file_cache.insert("/a.txt".into(), "x".into());
        assert!(diff_cache(&task, "/a.txt", DiffAgainst::Original, "").is_err());
    }
}
