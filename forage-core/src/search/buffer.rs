//! Bounded reorder window in front of a response stream.
//!
//! Entries accumulate with a sort key until the byte budget is exhausted;
//! at that point everything buffered flushes in key order (newest first)
//! and the writer degrades to raw pass-through, trading ordering for
//! completeness.

use std::io::Write;

use chrono::{DateTime, Utc};

/// Orders entries newest-first while the budget lasts.
#[derive(Debug)]
pub struct SortableWriter<W: Write> {
    inner: W,
    budget: usize,
    buffered_bytes: usize,
    entries: Vec<(DateTime<Utc>, usize, Vec<u8>)>,
    sequence: usize,
    overflowed: bool,
}

impl<W: Write> SortableWriter<W> {
    pub fn new(inner: W, budget: usize) -> Self {
        Self {
            inner,
            budget,
            buffered_bytes: 0,
            entries: Vec::new(),
            sequence: 0,
            overflowed: false,
        }
    }

    /// True once the budget was exhausted and ordering was given up.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Write one entry with its sort key.
    pub fn write_entry(&mut self, key: DateTime<Utc>, data: &[u8]) -> std::io::Result<()> {
        if self.overflowed {
            return self.inner.write_all(data);
        }
        self.buffered_bytes += data.len();
        self.entries.push((key, self.sequence, data.to_vec()));
        self.sequence += 1;
        if self.buffered_bytes > self.budget {
            self.flush_sorted()?;
            self.overflowed = true;
        }
        Ok(())
    }

    fn flush_sorted(&mut self) -> std::io::Result<()> {
        let mut entries = std::mem::take(&mut self.entries);
        // Newest first; arrival order breaks ties so output is stable.
        entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, _, data) in entries {
            self.inner.write_all(&data)?;
        }
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Flush any buffered entries and hand the sink back.
    pub fn finish(mut self) -> std::io::Result<W> {
        if !self.overflowed {
            self.flush_sorted()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}
