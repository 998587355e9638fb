//! The receiving side of the file sub-protocol.
//!
//! A replica holds a set of files and applies inbound [`FileActionEntry`]s
//! under optimistic concurrency: a change lands only while the proposer's
//! claimed checksum still matches the stored one (or `Force` is set). The
//! relay never runs one of these (it forwards actions untouched), but every
//! file-hosting endpoint does, and the integration tests drive the protocol
//! through it.

use std::collections::HashMap;

use super::checksum::checksum;
use super::diff;
use crate::protocol::packet::{
    FileActionEntry, FileActionKind, FileConsumeEntry, FileEntry, FileFlags, FileResult,
};

#[derive(Debug, Clone)]
struct FileState {
    contents: String,
    checksum: u32,
    read_only: bool,
}

/// An in-memory set of files reconciled through file-action packets.
#[derive(Debug, Default)]
pub struct FileReplica {
    files: HashMap<String, FileState>,
}

impl FileReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, e.g. from disk, before exposing it on a session.
    pub fn insert(&mut self, name: impl Into<String>, contents: &str, read_only: bool) {
        self.files.insert(
            name.into(),
            FileState {
                contents: contents.to_owned(),
                checksum: checksum(contents),
                read_only,
            },
        );
    }

    pub fn contents(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(|file| file.contents.as_str())
    }

    /// The stored checksum, or 0 for an absent file (matching the checksum
    /// of empty contents, so a first `Replace` tagged 0 is eligible).
    pub fn checksum_of(&self, name: &str) -> u32 {
        self.files.get(name).map_or(0, |file| file.checksum)
    }

    /// Entries for a `FileListing` packet, sorted by name.
    pub fn listing(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self
            .files
            .iter()
            .map(|(name, file)| FileEntry {
                file: name.clone(),
                checksum: file.checksum,
            })
            .collect();
        entries.sort_by(|a, b| a.file.cmp(&b.file));
        entries
    }

    /// Apply one proposed change, producing the outcome to report back.
    ///
    /// The reported checksum is always the checksum current *after* the
    /// call, so a rejected proposer learns what to re-fetch against. A patch
    /// that is eligible but cannot be applied (no base file, or fragments
    /// that do not cover it) is a `Failure` and leaves the file untouched,
    /// as does any write to a read-only file.
    pub fn apply_action(&mut self, entry: &FileActionEntry) -> FileConsumeEntry {
        let stored = self.checksum_of(&entry.file);
        if !entry.flags.contains(FileFlags::FORCE) && stored != entry.checksum {
            return self.outcome(&entry.file, FileResult::Reject);
        }
        if self.files.get(&entry.file).is_some_and(|file| file.read_only) {
            return self.outcome(&entry.file, FileResult::Failure);
        }

        match &entry.action {
            FileActionKind::Replace { contents } => {
                self.insert(
                    entry.file.clone(),
                    contents,
                    entry.flags.contains(FileFlags::READ_ONLY),
                );
                self.outcome(&entry.file, FileResult::Ok)
            }
            FileActionKind::Patch { delta } => {
                let Some(base) = self.contents(&entry.file) else {
                    return self.outcome(&entry.file, FileResult::Failure);
                };
                match diff::apply(base, delta) {
                    Ok(patched) => {
                        self.insert(entry.file.clone(), &patched, false);
                        self.outcome(&entry.file, FileResult::Ok)
                    }
                    Err(_) => self.outcome(&entry.file, FileResult::Failure),
                }
            }
            FileActionKind::Delete => {
                self.files.remove(&entry.file);
                self.outcome(&entry.file, FileResult::Ok)
            }
        }
    }

    fn outcome(&self, name: &str, result: FileResult) -> FileConsumeEntry {
        FileConsumeEntry {
            file: name.to_owned(),
            checksum: self.checksum_of(name),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::diff::Fragment;

    fn replace(file: &str, claimed: u32, contents: &str, flags: FileFlags) -> FileActionEntry {
        FileActionEntry {
            file: file.to_owned(),
            checksum: claimed,
            flags,
            action: FileActionKind::Replace {
                contents: contents.to_owned(),
            },
        }
    }

    #[test]
    fn replace_with_matching_checksum_is_applied() {
        let mut replica = FileReplica::new();
        replica.insert("startup.lua", "old", false);

        let outcome = replica.apply_action(&replace(
            "startup.lua",
            checksum("old"),
            "new",
            FileFlags::default(),
        ));
        assert_eq!(outcome.result, FileResult::Ok);
        assert_eq!(outcome.checksum, checksum("new"));
        assert_eq!(replica.contents("startup.lua"), Some("new"));
    }

    #[test]
    fn stale_checksum_is_rejected() {
        let mut replica = FileReplica::new();
        replica.insert("startup.lua", "old", false);

        // First writer wins.
        let first = replica.apply_action(&replace(
            "startup.lua",
            checksum("old"),
            "first",
            FileFlags::default(),
        ));
        assert_eq!(first.result, FileResult::Ok);

        // Second writer still claims the original checksum.
        let second = replica.apply_action(&replace(
            "startup.lua",
            checksum("old"),
            "second",
            FileFlags::default(),
        ));
        assert_eq!(second.result, FileResult::Reject);
        assert_eq!(second.checksum, checksum("first"));
        assert_eq!(replica.contents("startup.lua"), Some("first"));
    }

    #[test]
    fn force_overrides_the_checksum_gate() {
        let mut replica = FileReplica::new();
        replica.insert("startup.lua", "old", false);

        let outcome =
            replica.apply_action(&replace("startup.lua", 0xDEAD, "new", FileFlags::FORCE));
        assert_eq!(outcome.result, FileResult::Ok);
        assert_eq!(replica.contents("startup.lua"), Some("new"));
    }

    #[test]
    fn fresh_file_accepts_a_zero_checksum_replace() {
        let mut replica = FileReplica::new();
        let outcome = replica.apply_action(&replace("new.lua", 0, "hi", FileFlags::NEW));
        assert_eq!(outcome.result, FileResult::Ok);
        assert_eq!(replica.contents("new.lua"), Some("hi"));
    }

    #[test]
    fn read_only_files_fail_rather_than_reject() {
        let mut replica = FileReplica::new();
        replica.insert("rom/boot.lua", "boot", true);

        let outcome = replica.apply_action(&replace(
            "rom/boot.lua",
            checksum("boot"),
            "evil",
            FileFlags::default(),
        ));
        assert_eq!(outcome.result, FileResult::Failure);
        assert_eq!(replica.contents("rom/boot.lua"), Some("boot"));
    }

    #[test]
    fn patches_apply_against_the_stored_copy() {
        let mut replica = FileReplica::new();
        replica.insert("main.lua", "print(1)", false);

        let delta = diff::diff("print(1)", "print(2)");
        let outcome = replica.apply_action(&FileActionEntry {
            file: "main.lua".to_owned(),
            checksum: checksum("print(1)"),
            flags: FileFlags::default(),
            action: FileActionKind::Patch { delta },
        });
        assert_eq!(outcome.result, FileResult::Ok);
        assert_eq!(replica.contents("main.lua"), Some("print(2)"));
        assert_eq!(outcome.checksum, checksum("print(2)"));
    }

    #[test]
    fn unappliable_patch_is_a_failure_and_leaves_state_alone() {
        let mut replica = FileReplica::new();
        replica.insert("main.lua", "ab", false);

        let outcome = replica.apply_action(&FileActionEntry {
            file: "main.lua".to_owned(),
            checksum: checksum("ab"),
            flags: FileFlags::default(),
            // Claims more base text than exists.
            action: FileActionKind::Patch {
                delta: vec![Fragment::Same { length: 10 }],
            },
        });
        assert_eq!(outcome.result, FileResult::Failure);
        assert_eq!(replica.contents("main.lua"), Some("ab"));

        // A patch against a file that does not exist at all.
        let outcome = replica.apply_action(&FileActionEntry {
            file: "missing.lua".to_owned(),
            checksum: 0,
            flags: FileFlags::default(),
            action: FileActionKind::Patch {
                delta: vec![Fragment::Added {
                    contents: "x".to_owned(),
                }],
            },
        });
        assert_eq!(outcome.result, FileResult::Failure);
    }

    #[test]
    fn delete_removes_the_file() {
        let mut replica = FileReplica::new();
        replica.insert("tmp.lua", "x", false);

        let outcome = replica.apply_action(&FileActionEntry {
            file: "tmp.lua".to_owned(),
            checksum: checksum("x"),
            flags: FileFlags::default(),
            action: FileActionKind::Delete,
        });
        assert_eq!(outcome.result, FileResult::Ok);
        assert_eq!(outcome.checksum, 0);
        assert_eq!(replica.contents("tmp.lua"), None);
    }

    #[test]
    fn listing_is_sorted_and_checksummed() {
        let mut replica = FileReplica::new();
        replica.insert("b.lua", "bb", false);
        replica.insert("a.lua", "aa", false);

        let listing = replica.listing();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].file, "a.lua");
        assert_eq!(listing[0].checksum, checksum("aa"));
        assert_eq!(listing[1].file, "b.lua");
    }
}
