//! K-way merge over ordered entry iterators.

use crate::error::Result;
use crate::types::RowEntry;

/// A sorted stream of row entries. Implementations are lazy and single-pass.
pub trait KeyValueIterator {
    fn next_entry(&mut self) -> Result<Option<RowEntry>>;
}

impl<'a> KeyValueIterator for Box<dyn KeyValueIterator + 'a> {
    fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        (**self).next_entry()
    }
}

/// Merges sources ordered newest-first: on a key collision the
/// lowest-indexed source wins and the shadowed entries are discarded.
pub struct MergeIterator<T: KeyValueIterator> {
    sources: Vec<T>,
    heads: Vec<Option<RowEntry>>,
}

impl<T: KeyValueIterator> MergeIterator<T> {
    pub fn new(mut sources: Vec<T>) -> Result<Self> {
        let mut heads = Vec::with_capacity(sources.len());
        for source in sources.iter_mut() {
            heads.push(source.next_entry()?);
        }
        Ok(Self { sources, heads })
    }

    pub fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        let min_key = match self
            .heads
            .iter()
            .flatten()
            .map(|entry| entry.key.clone())
            .min()
        {
            Some(key) => key,
            None => return Ok(None),
        };

        let mut winner = None;
        for idx in 0..self.heads.len() {
            let is_match = matches!(&self.heads[idx], Some(entry) if entry.key == min_key);
            if !is_match {
                continue;
            }
            let entry = self.heads[idx].take();
            self.heads[idx] = self.sources[idx].next_entry()?;
            if winner.is_none() {
                winner = entry;
            }
        }
        Ok(winner)
    }
}

impl<T: KeyValueIterator> KeyValueIterator for MergeIterator<T> {
    fn next_entry(&mut self) -> Result<Option<RowEntry>> {
        MergeIterator::next_entry(self)
    }
}
