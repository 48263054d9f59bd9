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

use std::cmp::min;

use crate::core::store::{DataInput, DataOutput};
use crate::core::util::fst::OutputFactory;
use crate::error::Result;

/// Output algebra over non-negative i64 values that accumulate by addition
/// along a path: `common` is min, `subtract` is plain subtraction.  Zero is
/// the identity, so only positive values ever reach the compiled store.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositiveIntOutputs;

impl OutputFactory for PositiveIntOutputs {
    type Value = i64;

    fn empty(&self) -> i64 {
        0
    }

    fn common(&self, o1: &i64, o2: &i64) -> i64 {
        debug_assert!(*o1 >= 0 && *o2 >= 0);
        min(*o1, *o2)
    }

    fn subtract(&self, o1: &i64, inc: &i64) -> i64 {
        debug_assert!(*inc <= *o1);
        o1 - inc
    }

    fn add(&self, prefix: &i64, output: &i64) -> i64 {
        prefix + output
    }

    fn write(&self, output: &i64, data_out: &mut dyn DataOutput) -> Result<()> {
        debug_assert!(*output > 0);
        data_out.write_vlong(*output)
    }

    fn read(&self, data_in: &mut dyn DataInput) -> Result<i64> {
        data_in.read_vlong()
    }
}

/// Output algebra over byte sequences: `add` is concatenation, `common` the
/// longest common prefix, `subtract` removes a leading prefix.  The empty
/// sequence is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteSequenceOutputs;

impl OutputFactory for ByteSequenceOutputs {
    type Value = Vec<u8>;

    fn empty(&self) -> Vec<u8> {
        Vec::new()
    }

    fn common(&self, o1: &Vec<u8>, o2: &Vec<u8>) -> Vec<u8> {
        let len = o1
            .iter()
            .zip(o2.iter())
            .take_while(|(a, b)| a == b)
            .count();
        o1[..len].to_vec()
    }

    fn subtract(&self, o1: &Vec<u8>, inc: &Vec<u8>) -> Vec<u8> {
        debug_assert!(o1.starts_with(inc));
        o1[inc.len()..].to_vec()
    }

    fn add(&self, prefix: &Vec<u8>, output: &Vec<u8>) -> Vec<u8> {
        if prefix.is_empty() {
            output.clone()
        } else if output.is_empty() {
            prefix.clone()
        } else {
            let mut result = Vec::with_capacity(prefix.len() + output.len());
            result.extend_from_slice(prefix);
            result.extend_from_slice(output);
            result
        }
    }

    fn write(&self, output: &Vec<u8>, data_out: &mut dyn DataOutput) -> Result<()> {
        debug_assert!(!output.is_empty());
        data_out.write_vint(output.len() as i32)?;
        data_out.write_bytes(output)
    }

    fn read(&self, data_in: &mut dyn DataInput) -> Result<Vec<u8>> {
        let len = data_in.read_vint()? as usize;
        let mut bytes = vec![0u8; len];
        data_in.read_bytes(&mut bytes)?;
        Ok(bytes)
    }
}

/// Degenerate algebra used when the FST is really an FSA: every output is
/// the unit value, so no output bytes are ever written.  `merge` is
/// supported, which makes duplicate keys legal with this algebra.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOutputs;

impl OutputFactory for NoOutputs {
    type Value = ();

    fn empty(&self) {}

    fn common(&self, _o1: &(), _o2: &()) {}

    fn subtract(&self, _o1: &(), _inc: &()) {}

    fn add(&self, _prefix: &(), _output: &()) {}

    fn merge(&self, _first: &(), _second: &()) -> Result<()> {
        Ok(())
    }

    fn write(&self, _output: &(), _data_out: &mut dyn DataOutput) -> Result<()> {
        Ok(())
    }

    fn read(&self, _data_in: &mut dyn DataInput) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_int_laws() {
        let outputs = PositiveIntOutputs;
        assert_eq!(outputs.add(&outputs.empty(), &7), 7);
        assert_eq!(outputs.add(&7, &outputs.empty()), 7);
        assert_eq!(outputs.common(&10, &4), 4);
        assert_eq!(outputs.common(&4, &outputs.empty()), outputs.empty());
        let common = outputs.common(&10, &4);
        assert_eq!(outputs.add(&common, &outputs.subtract(&10, &common)), 10);
    }

    #[test]
    fn positive_int_merge_unsupported() {
        let outputs = PositiveIntOutputs;
        assert!(outputs.merge(&1, &2).is_err());
    }

    #[test]
    fn byte_sequence_laws() {
        let outputs = ByteSequenceOutputs;
        let a = vec![1u8, 2, 3];
        let b = vec![1u8, 2, 9];
        assert_eq!(outputs.common(&a, &b), vec![1, 2]);
        assert_eq!(outputs.common(&a, &outputs.empty()), outputs.empty());
        let common = outputs.common(&a, &b);
        assert_eq!(outputs.add(&common, &outputs.subtract(&a, &common)), a);
        assert_eq!(outputs.add(&outputs.empty(), &b), b);
    }

    #[test]
    fn no_outputs_merge() {
        let outputs = NoOutputs;
        assert!(outputs.merge(&(), &()).is_ok());
    }
}
