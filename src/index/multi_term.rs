use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::term_reader::{TermDocFreqs, TermPositions};
use super::types::{DocId, BAD_DOCID};

/// Docid-ordered union of per-barrel cursors
///
/// The heap holds one entry per live sub-cursor except the one positioned
/// on the current document.
pub struct MultiPostings<P> {
    subs: Vec<P>,
    heap: BinaryHeap<Reverse<(DocId, usize)>>,
    current: Option<usize>,
    started: bool,
}

pub type MultiTermDocs = MultiPostings<Box<dyn TermDocFreqs>>;
pub type MultiTermPositions = MultiPostings<Box<dyn TermPositions>>;

impl<P: TermDocFreqs> MultiPostings<P> {
    pub fn new(subs: Vec<P>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(subs.len()),
            subs,
            current: None,
            started: false,
        }
    }

    pub fn num_subs(&self) -> usize {
        self.subs.len()
    }

    fn push(&mut self, idx: usize, doc: Option<DocId>) {
        if let Some(doc) = doc {
            self.heap.push(Reverse((doc, idx)));
        }
    }

    fn pop_current(&mut self) -> Option<DocId> {
        match self.heap.pop() {
            Some(Reverse((doc, idx))) => {
                self.current = Some(idx);
                Some(doc)
            }
            None => {
                self.current = None;
                None
            }
        }
    }
}

impl<P: TermDocFreqs> TermDocFreqs for MultiPostings<P> {
    fn doc_freq(&self) -> u32 {
        self.subs.iter().map(|s| s.doc_freq()).sum()
    }

    fn ctf(&self) -> u64 {
        self.subs.iter().map(|s| s.ctf()).sum()
    }

    fn next(&mut self) -> Option<DocId> {
        if !self.started {
            self.started = true;
            for idx in 0..self.subs.len() {
                let doc = self.subs[idx].next();
                self.push(idx, doc);
            }
        } else if let Some(idx) = self.current.take() {
            let doc = self.subs[idx].next();
            self.push(idx, doc);
        }
        self.pop_current()
    }

    fn skip_to(&mut self, target: DocId) -> Option<DocId> {
        if !self.started {
            self.started = true;
            for idx in 0..self.subs.len() {
                let doc = self.subs[idx].skip_to(target);
                self.push(idx, doc);
            }
            return self.pop_current();
        }

        let idx = self.current.take()?;
        let doc = self.subs[idx].doc();
        if doc >= target {
            self.current = Some(idx);
            return Some(doc);
        }
        let doc = self.subs[idx].skip_to(target);
        self.push(idx, doc);

        while let Some(&Reverse((doc, idx))) = self.heap.peek() {
            if doc >= target {
                break;
            }
            self.heap.pop();
            let doc = self.subs[idx].skip_to(target);
            self.push(idx, doc);
        }
        self.pop_current()
    }

    fn doc(&self) -> DocId {
        self.current.map_or(BAD_DOCID, |idx| self.subs[idx].doc())
    }

    fn freq(&self) -> u32 {
        self.current.map_or(0, |idx| self.subs[idx].freq())
    }
}

impl<P: TermPositions> TermPositions for MultiPostings<P> {
    fn next_position(&mut self) -> Option<u32> {
        let idx = self.current?;
        self.subs[idx].next_position()
    }

    fn positions(&mut self) -> &[u32] {
        match self.current {
            Some(idx) => self.subs[idx].positions(),
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::term_reader::collect_postings;
    use crate::index::types::Posting;

    struct VecPostings {
        postings: Vec<Posting>,
        idx: Option<usize>,
        pos_idx: usize,
    }

    impl VecPostings {
        fn new(docs: &[DocId]) -> Self {
            Self {
                postings: docs
                    .iter()
                    .map(|&d| Posting::with_positions(d, vec![d % 3, d % 3 + 4]))
                    .collect(),
                idx: None,
                pos_idx: 0,
            }
        }

        fn current(&self) -> Option<&Posting> {
            self.idx.and_then(|i| self.postings.get(i))
        }
    }

    impl TermDocFreqs for VecPostings {
        fn doc_freq(&self) -> u32 {
            self.postings.len() as u32
        }

        fn ctf(&self) -> u64 {
            self.postings.len() as u64 * 2
        }

        fn next(&mut self) -> Option<DocId> {
            self.idx = Some(self.idx.map_or(0, |i| i + 1));
            self.pos_idx = 0;
            self.current().map(|p| p.doc_id)
        }

        fn skip_to(&mut self, target: DocId) -> Option<DocId> {
            if self.doc() != BAD_DOCID && self.doc() >= target {
                return Some(self.doc());
            }
            while let Some(doc) = self.next() {
                if doc >= target {
                    return Some(doc);
                }
            }
            None
        }

        fn doc(&self) -> DocId {
            self.current().map_or(BAD_DOCID, |p| p.doc_id)
        }

        fn freq(&self) -> u32 {
            self.current().map_or(0, |p| p.term_freq)
        }
    }

    impl TermPositions for VecPostings {
        fn next_position(&mut self) -> Option<u32> {
            let pos = self.current()?.positions.get(self.pos_idx).copied();
            self.pos_idx += 1;
            pos
        }

        fn positions(&mut self) -> &[u32] {
            match self.idx.and_then(|i| self.postings.get(i)) {
                Some(p) => &p.positions,
                None => &[],
            }
        }
    }

    fn multi(lists: &[&[DocId]]) -> MultiPostings<VecPostings> {
        MultiPostings::new(lists.iter().map(|l| VecPostings::new(l)).collect())
    }

    #[test]
    fn test_union_in_doc_order() {
        let mut m = multi(&[&[1, 2, 3], &[10, 11], &[], &[5, 7]]);
        assert_eq!(m.doc_freq(), 7);
        assert_eq!(m.ctf(), 14);
        let docs: Vec<DocId> = collect_postings(&mut m).iter().map(|p| p.doc_id).collect();
        assert_eq!(docs, vec![1, 2, 3, 5, 7, 10, 11]);
        assert_eq!(m.doc(), BAD_DOCID);
        assert_eq!(m.next(), None);
    }

    #[test]
    fn test_skip_to_across_subs() {
        let mut m = multi(&[&[1, 2, 3], &[10, 11], &[5, 7]]);
        assert_eq!(m.skip_to(4), Some(5));
        assert_eq!(m.skip_to(5), Some(5));
        assert_eq!(m.positions(), &[2, 6]);
        assert_eq!(m.next(), Some(7));
        assert_eq!(m.skip_to(11), Some(11));
        assert_eq!(m.freq(), 2);
        assert_eq!(m.skip_to(12), None);
        assert_eq!(m.doc(), BAD_DOCID);
    }

    #[test]
    fn test_next_position_follows_current_sub() {
        let mut m = multi(&[&[4], &[9]]);
        m.next();
        assert_eq!(m.next_position(), Some(1));
        assert_eq!(m.next_position(), Some(5));
        assert_eq!(m.next_position(), None);
        m.next();
        assert_eq!(m.next_position(), Some(0));
    }

    #[test]
    fn test_empty_union() {
        let mut m = multi(&[]);
        assert_eq!(m.next(), None);
        assert_eq!(m.skip_to(3), None);
        assert!(m.positions().is_empty());
    }
}
