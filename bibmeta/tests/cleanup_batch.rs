use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use bibmeta::action::{CleanupAction, CleanupUi, Decision, RenameConfirmation};
use bibmeta::cleanup::{CleanupPreset, CleanupRule, CleanupSettings, CleanupWorker, FileDirectories};
use bibmeta::core::{BibDatabase, Entry, EntryId};
use bibmeta::storage::FileRenamer;
use bibmeta::undo::{CompoundEdit, UndoLedger};

struct Library {
    files: RefCell<HashSet<PathBuf>>,
    locked: PathBuf,
}

impl Library {
    fn new(files: &[&str], locked: &str) -> Self {
        Self {
            files: RefCell::new(files.iter().map(PathBuf::from).collect()),
            locked: PathBuf::from(locked),
        }
    }
}

impl FileRenamer for Library {
    fn exists(&self, path: &Path) -> bool {
        self.files.borrow().contains(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if from == self.locked {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is locked"));
        }
        let mut files = self.files.borrow_mut();
        files.remove(from);
        files.insert(to.to_path_buf());
        Ok(())
    }
}

struct Accepting(CleanupPreset);

impl CleanupUi for Accepting {
    fn inform_nothing_selected(&mut self) {}
    fn block(&mut self) {}
    fn unblock(&mut self) {}
    fn output(&mut self, _message: &str) {}
    fn choose_preset(&mut self, _current: &CleanupPreset) -> Decision<CleanupPreset> {
        Decision::Proceed(self.0.clone())
    }
    fn confirm_file_renames(&mut self) -> RenameConfirmation {
        RenameConfirmation {
            proceed: true,
            ask_again: true,
        }
    }
    fn report_failed_renames(&mut self, _count: usize) {}
}

fn preset() -> CleanupPreset {
    CleanupPreset::empty()
        .with_rule(CleanupRule::NormalizeNames)
        .with_rule(CleanupRule::RenameLinkedFile)
        .with_filename_pattern("[bibtexkey]")
}

fn database() -> (BibDatabase, Vec<EntryId>) {
    let mut db = BibDatabase::new();
    db.metadata.set_file_directory("papers");
    let ids = ["E1", "E2", "E3"]
        .into_iter()
        .map(|key| {
            db.insert_entry(
                Entry::new("article")
                    .with_field("bibtexkey", key)
                    .with_field("author", "Grace Hopper")
                    .with_field("file", format!(":{}.pdf:PDF", key.to_lowercase())),
            )
        })
        .collect();
    (db, ids)
}

fn library() -> Library {
    Library::new(
        &["/db/papers/e1.pdf", "/db/papers/e2.pdf", "/db/papers/e3.pdf"],
        "/db/papers/e2.pdf",
    )
}

#[test]
fn failed_rename_on_one_entry_does_not_stop_the_others() {
    let (mut db, ids) = database();
    let files = library();
    let dirs = FileDirectories::resolve(&db.metadata, Some(Path::new("/db")), None);
    let worker = CleanupWorker::new(dirs, &files);
    let preset = preset();

    let mut failures = 0;
    let mut changed = Vec::new();
    for id in &ids {
        let entry = db.entry_mut(*id).expect("entry");
        let mut edit = CompoundEdit::new("Cleanup entry");
        let result = worker.cleanup_into(&preset, entry, &mut edit).expect("open edit");
        failures += result.unsuccessful_renames;
        changed.push(!result.changes.is_empty());
    }

    assert_eq!(failures, 1);
    assert_eq!(changed, vec![true, true, true]);
    assert_eq!(db.entry(ids[0]).and_then(|e| e.field("file")), Some(":E1.pdf:PDF"));
    assert_eq!(db.entry(ids[1]).and_then(|e| e.field("file")), Some(":e2.pdf:PDF"));
    assert_eq!(db.entry(ids[2]).and_then(|e| e.field("file")), Some(":E3.pdf:PDF"));
    assert!(files.exists(Path::new("/db/papers/E3.pdf")));
}

#[test]
fn batch_is_undoable_per_entry_and_idempotent() {
    let (mut db, ids) = database();
    let original = db.clone();
    let files = library();
    let mut ui = Accepting(preset());
    let mut settings = CleanupSettings::default();
    let mut ledger = UndoLedger::new();

    let report = CleanupAction::new(&mut ui, &files)
        .with_database_dir(Some(PathBuf::from("/db")))
        .run(&mut db, &ids, &mut settings, &mut ledger)
        .expect("cleanup");
    assert_eq!(report.modified_entries, 3);
    assert_eq!(report.unsuccessful_renames, 1);
    assert_eq!(ledger.len(), 3);
    let cleaned = db.clone();

    let again = CleanupAction::new(&mut ui, &files)
        .with_database_dir(Some(PathBuf::from("/db")))
        .run(&mut db, &ids, &mut settings, &mut ledger)
        .expect("second cleanup");
    assert_eq!(again.modified_entries, 0);
    assert_eq!(ledger.len(), 3);
    assert_eq!(db, cleaned);

    while ledger.can_undo() {
        ledger.undo(&mut db).expect("undo");
    }
    assert_eq!(db, original);

    while ledger.can_redo() {
        ledger.redo(&mut db).expect("redo");
    }
    assert_eq!(db, cleaned);
}
