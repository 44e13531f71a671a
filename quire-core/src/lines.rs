//! Line-start index over a text, keyed by 1-based line number.
//!
//! Every edit must locate its line to enforce line locks, so lookups are
//! a binary search over sorted line-start offsets instead of a scan of
//! the whole document. The index is patched in place from each applied
//! operation and only rebuilt from scratch after [`LineIndex::invalidate`].

use std::ops::RangeInclusive;

/// Sorted char offsets at which each line starts. `starts[0]` is always 0.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
    dirty: bool,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut index = Self {
            starts: vec![0],
            dirty: true,
        };
        index.refresh(text);
        index
    }

    /// Mark the index stale; the next [`LineIndex::refresh`] rebuilds it.
    pub fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuild from `text` if the index was invalidated.
    pub fn refresh(&mut self, text: &str) {
        if !self.dirty {
            return;
        }
        self.starts.clear();
        self.starts.push(0);
        for (offset, ch) in text.chars().enumerate() {
            if ch == '\n' {
                self.starts.push(offset + 1);
            }
        }
        self.dirty = false;
        log::trace!("line index rebuilt: {} lines", self.starts.len());
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// 1-based line containing the char at `offset`.
    ///
    /// An offset just past a newline belongs to the following line.
    pub fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset).max(1)
    }

    /// Char offset where `line` (1-based) starts.
    pub fn line_start(&self, line: usize) -> Option<usize> {
        line.checked_sub(1).and_then(|idx| self.starts.get(idx).copied())
    }

    /// Lines touched by an edit at `position` covering `length` chars.
    ///
    /// A zero-length range still touches the line holding `position`.
    /// Ranges running past the end clamp to the last line.
    pub fn lines_spanned(&self, position: usize, length: usize) -> RangeInclusive<usize> {
        let first = self.line_of(position);
        let last = self.line_of(position.saturating_add(length.saturating_sub(1)));
        first..=last.max(first)
    }

    /// Patch the index after `inserted` was placed at `position`.
    pub fn apply_insert(&mut self, position: usize, inserted: &str) {
        if self.dirty {
            return;
        }
        let added = inserted.chars().count();
        let line = self.line_of(position);

        for start in &mut self.starts[line..] {
            *start += added;
        }

        let new_starts: Vec<usize> = inserted
            .chars()
            .enumerate()
            .filter(|(_, ch)| *ch == '\n')
            .map(|(i, _)| position + i + 1)
            .collect();
        if !new_starts.is_empty() {
            self.starts.splice(line..line, new_starts);
        }
    }

    /// Patch the index after `deleted` was removed starting at `position`.
    pub fn apply_delete(&mut self, position: usize, deleted: &str) {
        if self.dirty {
            return;
        }
        let removed = deleted.chars().count();
        let end = position + removed;

        // Starts inside (position, end] came from newlines that are gone.
        self.starts.retain(|&start| start <= position || start > end);
        for start in self.starts.iter_mut().filter(|start| **start > end) {
            *start -= removed;
        }
    }
}

impl Default for LineIndex {
    fn default() -> Self {
        Self::new("")
    }
}
