//! Checks that the files a delivery claims to have produced exist.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::core::message::Deliverable;
use crate::core::safety::normalize;
use crate::core::validator::{ValidationCode, ValidationIssue};

/// One issue per deliverable that is missing, outside `workdir`, or of the
/// wrong kind. `kind` is `file` (the default) or `dir`; anything else only
/// has to exist.
pub fn verify_deliverables(deliverables: &[Deliverable], workdir: &Path) -> Vec<ValidationIssue> {
    let root = normalize(workdir);
    let real_root = fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
    let mut issues = Vec::new();
    for (idx, item) in deliverables.iter().enumerate() {
        let path = format!("$.result.deliverables[{idx}].path");
        let declared = item.path.trim();
        if declared.is_empty() {
            issues.push(ValidationIssue::new(
                ValidationCode::DeliveryInvalidDeliverable,
                path,
                "deliverable path is empty",
            ));
            continue;
        }
        let target = normalize(&root.join(declared));
        let escapes = !target.starts_with(&root)
            || fs::canonicalize(&target).is_ok_and(|real| !real.starts_with(&real_root));
        if escapes {
            issues.push(ValidationIssue::new(
                ValidationCode::DeliveryOutsideWorkdir,
                path,
                format!("deliverable is outside workdir {}: {declared}", root.display()),
            ));
            continue;
        }
        let Ok(meta) = fs::metadata(&target) else {
            issues.push(ValidationIssue::new(
                ValidationCode::DeliveryMissingDeliverable,
                path,
                format!("deliverable does not exist: {declared}"),
            ));
            continue;
        };
        match item.kind.trim().to_ascii_lowercase().as_str() {
            "dir" if !meta.is_dir() => issues.push(ValidationIssue::new(
                ValidationCode::DeliveryExpectDir,
                path,
                format!("deliverable is not a directory: {declared}"),
            )),
            "file" | "" if !meta.is_file() => issues.push(ValidationIssue::new(
                ValidationCode::DeliveryExpectFile,
                path,
                format!("deliverable is not a file: {declared}"),
            )),
            _ => {}
        }
    }
    debug!(
        declared = deliverables.len(),
        problems = issues.len(),
        "verified deliverables"
    );
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deliverable(path: &str, kind: &str) -> Deliverable {
        Deliverable {
            path: path.to_string(),
            kind: kind.to_string(),
            summary: String::new(),
        }
    }

    #[test]
    fn present_files_and_dirs_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/main.rs"), "fn main() {}").expect("write");
        let absolute = temp.path().join("src/main.rs").display().to_string();

        let issues = verify_deliverables(
            &[
                deliverable("src/main.rs", ""),
                deliverable("./src", "dir"),
                deliverable(&absolute, "file"),
                deliverable("src", "artifact"),
            ],
            temp.path(),
        );

        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn each_problem_gets_its_own_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("out")).expect("mkdir");
        fs::write(temp.path().join("notes.md"), "notes").expect("write");

        let issues = verify_deliverables(
            &[
                deliverable(" ", ""),
                deliverable("../elsewhere.txt", ""),
                deliverable("/etc/hosts", "file"),
                deliverable("missing.rs", ""),
                deliverable("notes.md", "dir"),
                deliverable("out", "file"),
            ],
            temp.path(),
        );

        let codes: Vec<ValidationCode> = issues.iter().map(|issue| issue.code).collect();
        assert_eq!(
            codes,
            vec![
                ValidationCode::DeliveryInvalidDeliverable,
                ValidationCode::DeliveryOutsideWorkdir,
                ValidationCode::DeliveryOutsideWorkdir,
                ValidationCode::DeliveryMissingDeliverable,
                ValidationCode::DeliveryExpectDir,
                ValidationCode::DeliveryExpectFile,
            ]
        );
        assert_eq!(issues[3].path, "$.result.deliverables[3].path");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_the_workdir_is_outside() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        fs::write(outside.path().join("secret"), "x").expect("write");
        std::os::unix::fs::symlink(outside.path().join("secret"), temp.path().join("link"))
            .expect("symlink");

        let issues = verify_deliverables(&[deliverable("link", "")], temp.path());

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, ValidationCode::DeliveryOutsideWorkdir);
    }
}
