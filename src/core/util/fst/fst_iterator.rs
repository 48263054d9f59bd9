// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::core::util::fst::fst_reader::END_LABEL;
use crate::core::util::fst::{FstArc, OutputFactory, StoreBytesReader, FST};
use crate::error::Result;

/// One positioned entry of the enumerator: the key bytes and the output
/// accumulated along its path.
#[derive(Debug)]
pub struct InputOutput<T> {
    pub input: Vec<u8>,
    pub output: T,
}

/// Enumerates a finished FST over byte labels in lexicographic order, with
/// exact, ceiling and floor seeks.
///
/// State per depth: the arc taken (`arcs`) and the output accumulated up to
/// it (`output`); `upto` is the current depth.  The label buffer keeps
/// offset 0 reserved so a consumer may prepend a terminator without
/// reallocating.
pub struct BytesRefFstEnum<'a, F: OutputFactory> {
    fst: &'a FST<F>,
    arcs: Vec<FstArc<F::Value>>,
    output: Vec<F::Value>,
    no_output: F::Value,
    upto: usize,
    current: Vec<u8>,
    target: Vec<u8>,
    target_length: usize,
}

impl<'a, F: OutputFactory> BytesRefFstEnum<'a, F> {
    pub fn new(fst: &'a FST<F>) -> BytesRefFstEnum<'a, F> {
        let no_output = fst.outputs().empty();
        let mut iter = BytesRefFstEnum {
            fst,
            arcs: vec![FstArc::empty(no_output.clone()), FstArc::empty(no_output.clone())],
            output: vec![no_output.clone(), no_output.clone()],
            no_output,
            upto: 0,
            current: vec![0u8; 10],
            target: Vec::new(),
            target_length: 0,
        };
        iter.arcs[0] = fst.first_arc();
        iter
    }

    /// Lexicographic successor, or `None` once exhausted.
    pub fn next(&mut self) -> Result<Option<InputOutput<F::Value>>> {
        self.do_next()?;
        Ok(self.set_result())
    }

    /// Positions at exactly `target` or returns `None`.
    pub fn seek_exact(&mut self, target: &[u8]) -> Result<Option<InputOutput<F::Value>>> {
        self.set_target(target);
        if self.do_seek_exact()? {
            debug_assert_eq!(self.upto, 1 + target.len());
            Ok(self.set_result())
        } else {
            Ok(None)
        }
    }

    /// Positions at the smallest enumerated key >= `target`.
    pub fn seek_ceil(&mut self, target: &[u8]) -> Result<Option<InputOutput<F::Value>>> {
        self.set_target(target);
        self.do_seek_ceil()?;
        Ok(self.set_result())
    }

    /// Positions at the largest enumerated key <= `target`.
    pub fn seek_floor(&mut self, target: &[u8]) -> Result<Option<InputOutput<F::Value>>> {
        self.set_target(target);
        self.do_seek_floor()?;
        Ok(self.set_result())
    }

    /// The entry the enumerator is positioned on, if any.
    pub fn current(&self) -> Option<InputOutput<F::Value>> {
        self.set_result()
    }

    fn set_target(&mut self, target: &[u8]) {
        self.target.clear();
        self.target.extend_from_slice(target);
        self.target_length = target.len();
    }

    fn set_result(&self) -> Option<InputOutput<F::Value>> {
        if self.upto == 0 {
            None
        } else {
            // the label buffer starts at offset 1; the trailing position
            // holds the implicit END_LABEL
            Some(InputOutput {
                input: self.current[1..self.upto].to_vec(),
                output: self.output[self.upto].clone(),
            })
        }
    }

    /// Label of `target` entering depth `upto`; `END_LABEL` past its end.
    fn target_label(&self) -> i32 {
        if self.upto - 1 == self.target_length {
            END_LABEL
        } else {
            i32::from(self.target[self.upto - 1])
        }
    }

    /// Label stored in the current key buffer at depth `upto`.
    fn current_label(&self) -> i32 {
        i32::from(self.current[self.upto])
    }

    fn set_current_label(&mut self, label: i32) {
        self.grow();
        self.current[self.upto] = label as u8;
    }

    fn grow(&mut self) {
        if self.current.len() <= self.upto + 1 {
            self.current.resize(self.upto + 2, 0);
        }
    }

    fn incr(&mut self) {
        self.upto += 1;
        self.grow();
        if self.arcs.len() <= self.upto {
            self.arcs
                .resize(self.upto + 1, FstArc::empty(self.no_output.clone()));
        }
        if self.output.len() <= self.upto {
            self.output.resize(self.upto + 1, self.no_output.clone());
        }
    }

    fn do_next(&mut self) -> Result<()> {
        let fst = self.fst;
        let mut reader = fst.bytes_reader();
        if self.upto == 0 {
            self.upto = 1;
            let first = fst.read_first_target_arc(&self.arcs[0], &mut reader)?;
            self.arcs[1] = first;
        } else {
            // pop until an arc that has a successor
            while self.arcs[self.upto].is_last() {
                self.upto -= 1;
                if self.upto == 0 {
                    return Ok(());
                }
            }
            fst.read_next_arc(&mut self.arcs[self.upto], &mut reader)?;
        }
        self.push_first(&mut reader)
    }

    /// Rewinds the enumerator state to the shared prefix between the
    /// current key and the target.
    fn rewind_prefix(&mut self, reader: &mut StoreBytesReader<'_>) -> Result<()> {
        if self.upto == 0 {
            self.upto = 1;
            let first = self.fst.read_first_target_arc(&self.arcs[0], reader)?;
            self.arcs[1] = first;
            return Ok(());
        }

        let current_limit = self.upto;
        self.upto = 1;
        while self.upto < current_limit && self.upto <= self.target_length + 1 {
            let cmp = self.current_label() - self.target_label();
            if cmp < 0 {
                // seek forward from here
                break;
            } else if cmp > 0 {
                // seek backwards -- reset this level to its first arc
                let first = self
                    .fst
                    .read_first_target_arc(&self.arcs[self.upto - 1], reader)?;
                self.arcs[self.upto] = first;
                break;
            }
            self.upto += 1;
        }
        Ok(())
    }

    /// Takes the current arc and then descends along first arcs down to
    /// the first final node.
    fn push_first(&mut self, reader: &mut StoreBytesReader<'_>) -> Result<()> {
        loop {
            let arc_output = self.arcs[self.upto].output.clone();
            self.output[self.upto] = self
                .fst
                .outputs()
                .add(&self.output[self.upto - 1], &arc_output);
            let label = self.arcs[self.upto].label;
            if label == END_LABEL {
                // final node
                return Ok(());
            }
            self.set_current_label(label);
            self.incr();
            let next = self
                .fst
                .read_first_target_arc(&self.arcs[self.upto - 1], reader)?;
            self.arcs[self.upto] = next;
        }
    }

    /// Takes the current arc and then descends along last arcs down to
    /// the first final node.
    fn push_last(&mut self, reader: &mut StoreBytesReader<'_>) -> Result<()> {
        loop {
            let label = self.arcs[self.upto].label;
            self.set_current_label(label);
            let arc_output = self.arcs[self.upto].output.clone();
            self.output[self.upto] = self
                .fst
                .outputs()
                .add(&self.output[self.upto - 1], &arc_output);
            if label == END_LABEL {
                // final node
                return Ok(());
            }
            self.incr();
            let next = self
                .fst
                .read_last_target_arc(&self.arcs[self.upto - 1], reader)?;
            self.arcs[self.upto] = next;
        }
    }

    fn do_seek_ceil(&mut self) -> Result<()> {
        let fst = self.fst;
        let mut reader = fst.bytes_reader();

        // save work by starting at the end of the prefix shared with the
        // current key
        self.rewind_prefix(&mut reader)?;

        let mut target_label = self.target_label();
        loop {
            let arc_label = self.arcs[self.upto].label;
            if arc_label == target_label {
                // match -- recurse
                let arc_output = self.arcs[self.upto].output.clone();
                self.output[self.upto] = fst
                    .outputs()
                    .add(&self.output[self.upto - 1], &arc_output);
                if target_label == END_LABEL {
                    return Ok(());
                }
                self.set_current_label(arc_label);
                self.incr();
                let next = fst.read_first_target_arc(&self.arcs[self.upto - 1], &mut reader)?;
                self.arcs[self.upto] = next;
                target_label = self.target_label();
            } else if arc_label > target_label {
                self.push_first(&mut reader)?;
                return Ok(());
            } else if self.arcs[self.upto].is_last() {
                // dead end: the target sorts after every arc here.
                // rollback to the last fork, then push
                self.upto -= 1;
                loop {
                    if self.upto == 0 {
                        return Ok(());
                    }
                    if !self.arcs[self.upto].is_last() {
                        fst.read_next_arc(&mut self.arcs[self.upto], &mut reader)?;
                        self.push_first(&mut reader)?;
                        return Ok(());
                    }
                    self.upto -= 1;
                }
            } else {
                fst.read_next_arc(&mut self.arcs[self.upto], &mut reader)?;
            }
        }
    }

    fn do_seek_floor(&mut self) -> Result<()> {
        let fst = self.fst;
        let mut reader = fst.bytes_reader();

        self.rewind_prefix(&mut reader)?;

        let mut target_label = self.target_label();
        loop {
            let arc_label = self.arcs[self.upto].label;
            if arc_label == target_label {
                // match -- recurse
                let arc_output = self.arcs[self.upto].output.clone();
                self.output[self.upto] = fst
                    .outputs()
                    .add(&self.output[self.upto - 1], &arc_output);
                if target_label == END_LABEL {
                    return Ok(());
                }
                self.set_current_label(arc_label);
                self.incr();
                let next = fst.read_first_target_arc(&self.arcs[self.upto - 1], &mut reader)?;
                self.arcs[self.upto] = next;
                target_label = self.target_label();
            } else if arc_label > target_label {
                // the target label is missing at this level.  walk backwards
                // until a level whose first arc sorts before the target,
                // then scan to the arc just before it and take the largest
                // key under that arc
                loop {
                    let first = fst.read_first_target_arc(&self.arcs[self.upto - 1], &mut reader)?;
                    self.arcs[self.upto] = first;
                    if self.arcs[self.upto].label < target_label {
                        while !self.arcs[self.upto].is_last()
                            && fst.read_next_arc_label(&self.arcs[self.upto], &mut reader)?
                                < target_label
                        {
                            fst.read_next_arc(&mut self.arcs[self.upto], &mut reader)?;
                        }
                        self.push_last(&mut reader)?;
                        return Ok(());
                    }
                    // keep backtracking
                    self.upto -= 1;
                    if self.upto == 0 {
                        return Ok(());
                    }
                    target_label = self.target_label();
                }
            } else if !self.arcs[self.upto].is_last() {
                if fst.read_next_arc_label(&self.arcs[self.upto], &mut reader)? > target_label {
                    self.push_last(&mut reader)?;
                    return Ok(());
                } else {
                    // keep scanning
                    fst.read_next_arc(&mut self.arcs[self.upto], &mut reader)?;
                }
            } else {
                self.push_last(&mut reader)?;
                return Ok(());
            }
        }
    }

    fn do_seek_exact(&mut self) -> Result<bool> {
        let fst = self.fst;
        let mut reader = fst.bytes_reader();

        self.rewind_prefix(&mut reader)?;

        let mut target_label = self.target_label();
        loop {
            let follow = self.arcs[self.upto - 1].clone();
            match fst.find_target_arc(target_label, &follow, &mut reader)? {
                None => {
                    // short circuit; leave this level positioned for a
                    // later next()
                    let first = fst.read_first_target_arc(&follow, &mut reader)?;
                    self.arcs[self.upto] = first;
                    return Ok(false);
                }
                Some(arc) => {
                    self.output[self.upto] =
                        fst.outputs().add(&self.output[self.upto - 1], &arc.output);
                    self.arcs[self.upto] = arc;
                    if target_label == END_LABEL {
                        return Ok(true);
                    }
                    self.set_current_label(target_label);
                    self.incr();
                    target_label = self.target_label();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::util::fst::fst_reader::InputType;
    use crate::core::util::fst::{FstBuilder, NoOutputs, PositiveIntOutputs};
    use crate::core::util::ints_ref::IntsRef;

    fn build_fst(keys: &[&[u8]], outputs: &[i64]) -> FST<PositiveIntOutputs> {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        for (key, &output) in keys.iter().zip(outputs.iter()) {
            let ints: Vec<i32> = key.iter().map(|&b| i32::from(b)).collect();
            builder.add(IntsRef::new(&ints), output).unwrap();
        }
        builder.finish().unwrap().unwrap()
    }

    #[test]
    fn next_walks_in_sorted_order() {
        let fst = build_fst(&[&[1], &[1, 2], &[2], &[2, 9]], &[11, 12, 13, 14]);
        let mut iter = BytesRefFstEnum::new(&fst);

        let expected: Vec<(Vec<u8>, i64)> = vec![
            (vec![1], 11),
            (vec![1, 2], 12),
            (vec![2], 13),
            (vec![2, 9], 14),
        ];
        for (key, output) in expected {
            let entry = iter.next().unwrap().unwrap();
            assert_eq!(entry.input, key);
            assert_eq!(entry.output, output);
        }
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn seek_semantics_over_sparse_keys() {
        let fst = build_fst(&[&[1], &[3], &[5]], &[10, 30, 50]);
        let mut iter = BytesRefFstEnum::new(&fst);

        let ceil = iter.seek_ceil(&[2]).unwrap().unwrap();
        assert_eq!(ceil.input, vec![3]);
        assert_eq!(ceil.output, 30);

        let floor = iter.seek_floor(&[4]).unwrap().unwrap();
        assert_eq!(floor.input, vec![3]);
        assert_eq!(floor.output, 30);

        assert!(iter.seek_exact(&[4]).unwrap().is_none());
        assert!(iter.seek_ceil(&[6]).unwrap().is_none());
        assert!(iter.seek_floor(&[0]).unwrap().is_none());
    }

    #[test]
    fn seek_hits_existing_keys() {
        let fst = build_fst(&[&[1], &[3], &[5]], &[10, 30, 50]);
        let mut iter = BytesRefFstEnum::new(&fst);

        assert_eq!(iter.seek_ceil(&[3]).unwrap().unwrap().input, vec![3]);
        assert_eq!(iter.seek_floor(&[3]).unwrap().unwrap().input, vec![3]);
        let exact = iter.seek_exact(&[3]).unwrap().unwrap();
        assert_eq!(exact.input, vec![3]);
        assert_eq!(exact.output, 30);
        assert_eq!(iter.current().unwrap().input, vec![3]);
    }

    #[test]
    fn seek_boundaries() {
        let fst = build_fst(&[&[2, 2], &[7]], &[1, 2]);
        let mut iter = BytesRefFstEnum::new(&fst);

        // before the first key
        assert_eq!(iter.seek_ceil(&[0]).unwrap().unwrap().input, vec![2, 2]);
        // past the last key
        assert_eq!(iter.seek_floor(&[9]).unwrap().unwrap().input, vec![7]);
    }

    #[test]
    fn floor_falls_back_to_shorter_prefix_key() {
        // floor([1,2,9]) must come back to [1,2] even though [1,2,3] exists
        let fst = build_fst(&[&[1, 2], &[1, 2, 3], &[1, 4]], &[1, 2, 3]);
        let mut iter = BytesRefFstEnum::new(&fst);

        let floor = iter.seek_floor(&[1, 2, 9]).unwrap().unwrap();
        assert_eq!(floor.input, vec![1, 2, 3]);

        let floor = iter.seek_floor(&[1, 3]).unwrap().unwrap();
        assert_eq!(floor.input, vec![1, 2, 3]);

        let floor = iter.seek_floor(&[1, 2]).unwrap().unwrap();
        assert_eq!(floor.input, vec![1, 2]);
    }

    #[test]
    fn ceil_descends_past_final_prefix() {
        let fst = build_fst(&[&[1, 2], &[1, 2, 3]], &[5, 6]);
        let mut iter = BytesRefFstEnum::new(&fst);

        // ceiling of a proper prefix is the prefix key itself
        let ceil = iter.seek_ceil(&[1]).unwrap().unwrap();
        assert_eq!(ceil.input, vec![1, 2]);
        assert_eq!(ceil.output, 5);

        let ceil = iter.seek_ceil(&[1, 2, 1]).unwrap().unwrap();
        assert_eq!(ceil.input, vec![1, 2, 3]);
        assert_eq!(ceil.output, 6);
    }

    #[test]
    fn next_after_seek_continues_in_order() {
        let fst = build_fst(&[&[1], &[3], &[5]], &[10, 30, 50]);
        let mut iter = BytesRefFstEnum::new(&fst);

        assert_eq!(iter.seek_ceil(&[2]).unwrap().unwrap().input, vec![3]);
        assert_eq!(iter.next().unwrap().unwrap().input, vec![5]);
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn empty_key_is_enumerated_first() {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        builder.add(IntsRef::new(&[]), 7).unwrap();
        builder.add(IntsRef::new(&[2]), 9).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.input, Vec::<u8>::new());
        assert_eq!(first.output, 7);
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.input, vec![2]);
        assert_eq!(second.output, 9);
        assert!(iter.next().unwrap().is_none());

        // the empty key also answers seeks
        let mut iter = BytesRefFstEnum::new(&fst);
        assert_eq!(iter.seek_exact(&[]).unwrap().unwrap().output, 7);
        let mut iter = BytesRefFstEnum::new(&fst);
        assert_eq!(iter.seek_floor(&[1]).unwrap().unwrap().input, Vec::<u8>::new());
    }

    #[test]
    fn seeks_work_without_outputs() {
        let mut builder = FstBuilder::new(InputType::Byte1, NoOutputs);
        for key in &[[1u8, 1], [1, 7], [4, 2]] {
            let ints: Vec<i32> = key.iter().map(|&b| i32::from(b)).collect();
            builder.add(IntsRef::new(&ints), ()).unwrap();
        }
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        assert_eq!(iter.seek_ceil(&[1, 2]).unwrap().unwrap().input, vec![1, 7]);
        assert_eq!(iter.seek_floor(&[4, 1]).unwrap().unwrap().input, vec![1, 7]);
        assert_eq!(iter.seek_exact(&[4, 2]).unwrap().unwrap().input, vec![4, 2]);
    }
}
