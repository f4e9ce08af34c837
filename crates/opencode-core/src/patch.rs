//! Patch engine for the `*** Begin Patch` format.
//!
//! Applying a patch takes three steps. [`text_to_patch`] parses and matches
//! hunks against the original files. [`patch_to_commit`] computes the new
//! contents. [`apply_commit`] writes them. Every validation error surfaces
//! before the last step, so a rejected patch never touches the disk.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use thiserror::Error;

/// Patches whose accumulated fuzz exceeds this are rejected.
pub const MAX_FUZZ: usize = 3;

const BEGIN_PATCH: &str = "*** Begin Patch";
const END_PATCH: &str = "*** End Patch";
const UPDATE_FILE: &str = "*** Update File: ";
const DELETE_FILE: &str = "*** Delete File: ";
const ADD_FILE: &str = "*** Add File: ";
const MOVE_TO: &str = "*** Move to: ";
const END_OF_FILE: &str = "*** End of File";

const EOF_FUZZ: usize = 10_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("invalid patch: {0}")]
    Invalid(String),

    #[error("duplicate path in patch: {0}")]
    DuplicatePath(String),

    #[error("file not found: {0}")]
    MissingFile(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("invalid context in {path}: {context}")]
    InvalidContext { path: String, context: String },

    #[error("overlapping hunks in {0}")]
    Overlap(String),

    #[error("patch contains fuzzy matches (fuzz level: {0}); make the context lines more precise")]
    Fuzzy(usize),

    #[error("failed to write {path}: {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Delete,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Line index in the original file where the deletion starts.
    pub orig_index: usize,
    pub del_lines: Vec<String>,
    pub ins_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchAction {
    pub kind: ActionKind,
    pub new_file: Option<String>,
    pub chunks: Vec<Chunk>,
    pub move_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub actions: BTreeMap<String, PatchAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Add {
        content: String,
    },
    Delete {
        old_content: String,
    },
    Update {
        old_content: String,
        new_content: String,
        move_path: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub changes: BTreeMap<String, FileChange>,
}

/// Paths the patch updates or deletes; their contents must be loaded first.
pub fn identify_files_needed(text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in text.trim().lines() {
        if let Some(p) = line.strip_prefix(UPDATE_FILE).or_else(|| line.strip_prefix(DELETE_FILE)) {
            paths.push(p.trim().to_string());
        }
    }
    paths
}

/// Paths the patch adds.
pub fn identify_files_added(text: &str) -> Vec<String> {
    text.trim()
        .lines()
        .filter_map(|l| l.strip_prefix(ADD_FILE))
        .map(|p| p.trim().to_string())
        .collect()
}

/// Parse `text` against the original files. Returns the patch and its fuzz.
pub fn text_to_patch(text: &str, orig: &HashMap<String, String>) -> Result<(Patch, usize), PatchError> {
    let lines: Vec<&str> = text.trim().split('\n').map(|l| l.trim_end_matches('\r')).collect();
    if lines.len() < 2 || lines[0].trim() != BEGIN_PATCH {
        return Err(PatchError::Invalid(format!("patch must start with {BEGIN_PATCH}")));
    }
    if lines[lines.len() - 1].trim() != END_PATCH {
        return Err(PatchError::Invalid(format!("patch must end with {END_PATCH}")));
    }
    let mut parser = Parser {
        orig,
        lines,
        index: 1,
        patch: Patch::default(),
        fuzz: 0,
    };
    parser.parse()?;
    Ok((parser.patch, parser.fuzz))
}

struct Parser<'a> {
    orig: &'a HashMap<String, String>,
    lines: Vec<&'a str>,
    index: usize,
    patch: Patch,
    fuzz: usize,
}

impl<'a> Parser<'a> {
    fn is_done(&self, prefixes: &[&str]) -> bool {
        if self.index >= self.lines.len() {
            return true;
        }
        let line = self.lines[self.index];
        prefixes.iter().any(|p| line.starts_with(p))
    }

    fn read_str(&mut self, prefix: &str) -> Option<String> {
        let line = self.lines.get(self.index)?;
        let rest = line.strip_prefix(prefix)?;
        self.index += 1;
        Some(rest.trim().to_string())
    }

    fn parse(&mut self) -> Result<(), PatchError> {
        while !self.is_done(&[END_PATCH]) {
            if let Some(path) = self.read_str(UPDATE_FILE) {
                self.ensure_new(&path)?;
                let move_path = self.read_str(MOVE_TO);
                let orig = self.orig;
                let text = orig
                    .get(&path)
                    .ok_or_else(|| PatchError::MissingFile(path.clone()))?;
                let mut action = self.parse_update_file(&path, text)?;
                action.move_path = move_path;
                self.patch.actions.insert(path, action);
            } else if let Some(path) = self.read_str(DELETE_FILE) {
                self.ensure_new(&path)?;
                if !self.orig.contains_key(&path) {
                    return Err(PatchError::MissingFile(path));
                }
                self.patch.actions.insert(
                    path,
                    PatchAction {
                        kind: ActionKind::Delete,
                        new_file: None,
                        chunks: Vec::new(),
                        move_path: None,
                    },
                );
            } else if let Some(path) = self.read_str(ADD_FILE) {
                self.ensure_new(&path)?;
                if self.orig.contains_key(&path) {
                    return Err(PatchError::FileExists(path));
                }
                let action = self.parse_add_file()?;
                self.patch.actions.insert(path, action);
            } else {
                return Err(PatchError::Invalid(format!(
                    "unknown line: {}",
                    self.lines[self.index]
                )));
            }
        }
        if self.index >= self.lines.len() {
            return Err(PatchError::Invalid("missing end of patch".to_string()));
        }
        Ok(())
    }

    fn ensure_new(&self, path: &str) -> Result<(), PatchError> {
        if self.patch.actions.contains_key(path) {
            return Err(PatchError::DuplicatePath(path.to_string()));
        }
        Ok(())
    }

    fn parse_update_file(&mut self, path: &str, text: &str) -> Result<PatchAction, PatchError> {
        let file_lines: Vec<&str> = text.split('\n').collect();
        let mut action = PatchAction {
            kind: ActionKind::Update,
            new_file: None,
            chunks: Vec::new(),
            move_path: None,
        };
        let mut index = 0;
        let stops = [END_PATCH, UPDATE_FILE, DELETE_FILE, ADD_FILE, END_OF_FILE];

        while !self.is_done(&stops) {
            let def_str = if let Some(rest) = self.read_str("@@ ") {
                rest
            } else if self.lines.get(self.index) == Some(&"@@") {
                self.index += 1;
                String::new()
            } else if index != 0 {
                return Err(PatchError::Invalid(format!(
                    "expected @@ in {path}, got: {}",
                    self.lines[self.index]
                )));
            } else {
                String::new()
            };

            if !def_str.trim().is_empty() {
                let target = normalize(&def_str);
                if let Some(pos) = file_lines[index..].iter().position(|l| normalize(l) == target) {
                    index += pos + 1;
                } else if let Some(pos) = file_lines[index..]
                    .iter()
                    .position(|l| normalize(l.trim()) == target.trim())
                {
                    index += pos + 1;
                    self.fuzz += 1;
                }
            }

            let section = peek_next_section(&self.lines, self.index)?;
            let (new_index, fuzz) = find_context(&file_lines, &section.context, index, section.eof);
            let Some(new_index) = new_index else {
                return Err(PatchError::InvalidContext {
                    path: path.to_string(),
                    context: section.context.join("\n"),
                });
            };
            self.fuzz += fuzz;
            for mut chunk in section.chunks {
                chunk.orig_index += new_index;
                action.chunks.push(chunk);
            }
            index = new_index + section.context.len();
            self.index = section.end;
        }
        Ok(action)
    }

    fn parse_add_file(&mut self) -> Result<PatchAction, PatchError> {
        let mut content = String::new();
        while !self.is_done(&[END_PATCH, UPDATE_FILE, DELETE_FILE, ADD_FILE]) {
            let line = self.lines[self.index];
            let Some(body) = line.strip_prefix('+') else {
                return Err(PatchError::Invalid(format!("invalid add file line: {line}")));
            };
            content.push_str(body);
            content.push('\n');
            self.index += 1;
        }
        Ok(PatchAction {
            kind: ActionKind::Add,
            new_file: Some(content),
            chunks: Vec::new(),
            move_path: None,
        })
    }
}

struct Section {
    context: Vec<String>,
    chunks: Vec<Chunk>,
    end: usize,
    eof: bool,
}

#[derive(PartialEq, Clone, Copy)]
enum Mode {
    Keep,
    Add,
    Delete,
}

fn peek_next_section(lines: &[&str], start: usize) -> Result<Section, PatchError> {
    let mut old: Vec<String> = Vec::new();
    let mut del_lines: Vec<String> = Vec::new();
    let mut ins_lines: Vec<String> = Vec::new();
    let mut chunks = Vec::new();
    let mut mode = Mode::Keep;
    let mut index = start;

    while index < lines.len() {
        let line = lines[index];
        if line.starts_with("@@")
            || line.starts_with(END_PATCH)
            || line.starts_with(UPDATE_FILE)
            || line.starts_with(DELETE_FILE)
            || line.starts_with(ADD_FILE)
            || line.starts_with(END_OF_FILE)
        {
            break;
        }
        if line == "***" {
            break;
        }
        if line.starts_with("***") {
            return Err(PatchError::Invalid(format!("invalid line: {line}")));
        }
        index += 1;

        let last_mode = mode;
        let (next_mode, body) = match line.chars().next() {
            Some('+') => (Mode::Add, &line[1..]),
            Some('-') => (Mode::Delete, &line[1..]),
            Some(' ') => (Mode::Keep, &line[1..]),
            None => (Mode::Keep, ""),
            Some(_) => return Err(PatchError::Invalid(format!("invalid line: {line}"))),
        };
        mode = next_mode;

        if mode == Mode::Keep && last_mode != mode && (!ins_lines.is_empty() || !del_lines.is_empty()) {
            chunks.push(Chunk {
                orig_index: old.len() - del_lines.len(),
                del_lines: std::mem::take(&mut del_lines),
                ins_lines: std::mem::take(&mut ins_lines),
            });
        }
        match mode {
            Mode::Delete => {
                del_lines.push(body.to_string());
                old.push(body.to_string());
            }
            Mode::Add => ins_lines.push(body.to_string()),
            Mode::Keep => old.push(body.to_string()),
        }
    }

    if !ins_lines.is_empty() || !del_lines.is_empty() {
        chunks.push(Chunk {
            orig_index: old.len() - del_lines.len(),
            del_lines,
            ins_lines,
        });
    }

    let mut eof = false;
    if index < lines.len() && lines[index] == END_OF_FILE {
        index += 1;
        eof = true;
    }
    if index == start {
        return Err(PatchError::Invalid("empty hunk".to_string()));
    }
    Ok(Section {
        context: old,
        chunks,
        end: index,
        eof,
    })
}

/// Locate `context` at or after `start`. Exact matches cost nothing,
/// trailing-whitespace matches cost 1, fully trimmed matches cost 100.
fn find_context_core(lines: &[&str], context: &[String], start: usize) -> (Option<usize>, usize) {
    if context.is_empty() {
        return (Some(start), 0);
    }
    let passes: [(fn(&str) -> &str, usize); 3] = [(|s| s, 0), (str::trim_end, 1), (str::trim, 100)];
    for (strip, fuzz) in passes {
        let wanted: Vec<String> = context.iter().map(|c| normalize(strip(c))).collect();
        let last = lines.len().saturating_sub(context.len());
        for i in start..=last {
            if i + context.len() > lines.len() {
                break;
            }
            if lines[i..i + context.len()]
                .iter()
                .zip(&wanted)
                .all(|(l, w)| normalize(strip(l)) == *w)
            {
                return (Some(i), fuzz);
            }
        }
    }
    (None, 0)
}

fn find_context(lines: &[&str], context: &[String], start: usize, eof: bool) -> (Option<usize>, usize) {
    if eof {
        let tail = lines.len().saturating_sub(context.len());
        let (found, fuzz) = find_context_core(lines, context, tail);
        if found.is_some() {
            return (found, fuzz);
        }
        let (found, fuzz) = find_context_core(lines, context, start);
        return (found, fuzz + EOF_FUZZ);
    }
    find_context_core(lines, context, start)
}

/// Fold unicode punctuation to its ASCII form for matching.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' => out.push('"'),
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}' | '\u{2212}' => {
                out.push('-')
            }
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' | '\u{202F}' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Compute the resulting file contents for every action.
pub fn patch_to_commit(patch: &Patch, orig: &HashMap<String, String>) -> Result<Commit, PatchError> {
    let mut commit = Commit::default();
    for (path, action) in &patch.actions {
        let change = match action.kind {
            ActionKind::Add => FileChange::Add {
                content: action.new_file.clone().unwrap_or_default(),
            },
            ActionKind::Delete => FileChange::Delete {
                old_content: orig
                    .get(path)
                    .cloned()
                    .ok_or_else(|| PatchError::MissingFile(path.clone()))?,
            },
            ActionKind::Update => {
                let old_content = orig
                    .get(path)
                    .ok_or_else(|| PatchError::MissingFile(path.clone()))?;
                FileChange::Update {
                    new_content: updated_file(old_content, action, path)?,
                    old_content: old_content.clone(),
                    move_path: action.move_path.clone(),
                }
            }
        };
        commit.changes.insert(path.clone(), change);
    }
    Ok(commit)
}

fn updated_file(text: &str, action: &PatchAction, path: &str) -> Result<String, PatchError> {
    let orig_lines: Vec<&str> = text.split('\n').collect();
    let mut dest: Vec<&str> = Vec::with_capacity(orig_lines.len());
    let mut cursor = 0;
    for chunk in &action.chunks {
        if chunk.orig_index > orig_lines.len() {
            return Err(PatchError::InvalidContext {
                path: path.to_string(),
                context: format!("hunk at line {} is past the end of the file", chunk.orig_index + 1),
            });
        }
        if cursor > chunk.orig_index {
            return Err(PatchError::Overlap(path.to_string()));
        }
        dest.extend_from_slice(&orig_lines[cursor..chunk.orig_index]);
        dest.extend(chunk.ins_lines.iter().map(String::as_str));
        cursor = (chunk.orig_index + chunk.del_lines.len()).min(orig_lines.len());
    }
    dest.extend_from_slice(&orig_lines[cursor..]);
    Ok(dest.join("\n"))
}

/// Write a commit through the given callbacks.
pub fn apply_commit<W, R>(commit: &Commit, mut write: W, mut remove: R) -> Result<(), PatchError>
where
    W: FnMut(&str, &str) -> std::io::Result<()>,
    R: FnMut(&str) -> std::io::Result<()>,
{
    let io_err = |path: &str, e: std::io::Error| PatchError::Io {
        path: path.to_string(),
        reason: e.to_string(),
    };
    for (path, change) in &commit.changes {
        match change {
            FileChange::Add { content } => write(path, content).map_err(|e| io_err(path, e))?,
            FileChange::Delete { .. } => remove(path).map_err(|e| io_err(path, e))?,
            FileChange::Update {
                new_content,
                move_path,
                ..
            } => match move_path {
                Some(dest) => {
                    write(dest, new_content).map_err(|e| io_err(dest, e))?;
                    remove(path).map_err(|e| io_err(path, e))?;
                }
                None => write(path, new_content).map_err(|e| io_err(path, e))?,
            },
        }
    }
    Ok(())
}

/// Write a commit to the local filesystem, creating parent directories.
pub fn apply_commit_to_disk(commit: &Commit) -> Result<(), PatchError> {
    apply_commit(
        commit,
        |path, content| {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)
        },
        |path| std::fs::remove_file(path),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn commit_for(text: &str, orig: &HashMap<String, String>) -> Result<Commit, PatchError> {
        let (patch, fuzz) = text_to_patch(text, orig)?;
        assert!(fuzz <= MAX_FUZZ, "fuzz {fuzz}");
        patch_to_commit(&patch, orig)
    }

    #[test]
    fn test_update_with_context() {
        let orig = files(&[("a.txt", "one\ntwo\nthree\n")]);
        let text = "*** Begin Patch\n*** Update File: a.txt\n@@\n one\n-two\n+TWO\n three\n*** End Patch";
        let commit = commit_for(text, &orig).unwrap();
        assert_eq!(
            commit.changes["a.txt"],
            FileChange::Update {
                old_content: "one\ntwo\nthree\n".into(),
                new_content: "one\nTWO\nthree\n".into(),
                move_path: None,
            }
        );
    }

    #[test]
    fn test_add_delete_and_move() {
        let orig = files(&[("old.txt", "x\n"), ("gone.txt", "bye\n")]);
        let text = "*** Begin Patch\n*** Add File: new.txt\n+hello\n+world\n*** Delete File: gone.txt\n*** Update File: old.txt\n*** Move to: moved.txt\n@@\n-x\n+y\n*** End Patch";
        let commit = commit_for(text, &orig).unwrap();
        assert_eq!(
            commit.changes["new.txt"],
            FileChange::Add {
                content: "hello\nworld\n".into()
            }
        );
        assert!(matches!(commit.changes["gone.txt"], FileChange::Delete { .. }));
        match &commit.changes["old.txt"] {
            FileChange::Update {
                new_content,
                move_path,
                ..
            } => {
                assert_eq!(new_content, "y\n");
                assert_eq!(move_path.as_deref(), Some("moved.txt"));
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_rejections_happen_before_commit() {
        let orig = files(&[("a.txt", "a\n")]);
        let dup = "*** Begin Patch\n*** Update File: a.txt\n@@\n-a\n+b\n*** Update File: a.txt\n@@\n-a\n+c\n*** End Patch";
        assert_eq!(
            text_to_patch(dup, &orig).unwrap_err(),
            PatchError::DuplicatePath("a.txt".into())
        );
        let add_existing = "*** Begin Patch\n*** Add File: a.txt\n+x\n*** End Patch";
        assert_eq!(
            text_to_patch(add_existing, &orig).unwrap_err(),
            PatchError::FileExists("a.txt".into())
        );
        let missing = "*** Begin Patch\n*** Update File: b.txt\n@@\n-a\n+b\n*** End Patch";
        assert_eq!(
            text_to_patch(missing, &orig).unwrap_err(),
            PatchError::MissingFile("b.txt".into())
        );
        let bad_context = "*** Begin Patch\n*** Update File: a.txt\n@@\n-zzz\n+b\n*** End Patch";
        assert!(matches!(
            text_to_patch(bad_context, &orig).unwrap_err(),
            PatchError::InvalidContext { .. }
        ));
    }

    #[test]
    fn test_unicode_punctuation_matches() {
        let orig = files(&[("q.txt", "say \u{201C}hi\u{201D} \u{2014} ok\u{2026}\n")]);
        let text = "*** Begin Patch\n*** Update File: q.txt\n@@\n-say \"hi\" - ok...\n+say hello\n*** End Patch";
        let (patch, fuzz) = text_to_patch(text, &orig).unwrap();
        assert_eq!(fuzz, 0);
        let commit = patch_to_commit(&patch, &orig).unwrap();
        match &commit.changes["q.txt"] {
            FileChange::Update { new_content, .. } => assert_eq!(new_content, "say hello\n"),
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_trimmed_match_is_too_fuzzy() {
        let orig = files(&[("a.txt", "    indented\n")]);
        let text = "*** Begin Patch\n*** Update File: a.txt\n@@\n-indented\n+x\n*** End Patch";
        let (_, fuzz) = text_to_patch(text, &orig).unwrap();
        assert!(fuzz > MAX_FUZZ);
    }

    #[test]
    fn test_end_of_file_anchor() {
        let orig = files(&[("a.txt", "x\ny\nx\ny")]);
        let text = "*** Begin Patch\n*** Update File: a.txt\n@@\n x\n-y\n+z\n*** End of File\n*** End Patch";
        let commit = commit_for(text, &orig).unwrap();
        match &commit.changes["a.txt"] {
            FileChange::Update { new_content, .. } => assert_eq!(new_content, "x\ny\nx\nz"),
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_apply_commit_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/new.txt");
        let path = target.to_string_lossy().to_string();
        let text = format!("*** Begin Patch\n*** Add File: {path}\n+created\n*** End Patch");
        let commit = commit_for(&text, &HashMap::new()).unwrap();
        apply_commit_to_disk(&commit).unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "created\n");
    }

    #[test]
    fn test_missing_envelope() {
        assert!(matches!(
            text_to_patch("*** Update File: a\n", &HashMap::new()),
            Err(PatchError::Invalid(_))
        ));
    }
}
