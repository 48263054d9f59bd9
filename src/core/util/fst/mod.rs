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

mod bytes_store;
mod fst_builder;
mod fst_iterator;
mod fst_reader;
mod outputs;

pub use self::bytes_store::{BytesStore, StoreBytesReader};
pub use self::fst_builder::{BuilderArc, FreezeTail, FstBuilder, Node, UnCompiledNode};
pub use self::fst_iterator::{BytesRefFstEnum, InputOutput};
pub use self::fst_reader::{
    CompiledAddress, FstArc, InputType, END_LABEL, FINAL_END_NODE, FST, NON_FINAL_END_NODE,
};
pub use self::outputs::{ByteSequenceOutputs, NoOutputs, PositiveIntOutputs};

use std::fmt::Debug;
use std::hash::Hash;

use crate::core::store::{DataInput, DataOutput};
use crate::error::{ErrorKind::UnsupportedOperation, Result};

/// The output algebra of an FST.
///
/// Outputs accumulate along a path under `add`; the builder pushes values as
/// far toward the root as possible by factoring out the `common` prefix of
/// the outputs routed through an arc and `subtract`ing it from each.  The
/// algebra must satisfy:
///
/// * `add(empty(), x) == add(x, empty()) == x`
/// * `common(x, empty()) == empty()`
/// * `add(common(a, b), subtract(a, common(a, b))) == a`
///
/// `empty()` is the identity (NO_OUTPUT); the builder collapses any value
/// equal to it back onto the identity, so implementations never see an
/// "equal but distinct" empty value.
pub trait OutputFactory: Clone {
    type Value: Clone + Eq + Hash + Debug;

    /// Returns the identity element (NO_OUTPUT) of this algebra.
    fn empty(&self) -> Self::Value;

    /// Returns the longest common prefix of two outputs.
    fn common(&self, o1: &Self::Value, o2: &Self::Value) -> Self::Value;

    /// Returns the suffix of `o1` left after removing the prefix `inc`.
    /// `inc` must be a prefix of `o1` in the sense of `common`.
    fn subtract(&self, o1: &Self::Value, inc: &Self::Value) -> Self::Value;

    /// Prepends `prefix` onto `output`.
    fn add(&self, prefix: &Self::Value, output: &Self::Value) -> Self::Value;

    /// Combines two outputs mapped from the same input.  Only required of
    /// algebras that allow the same input to be added more than once in a
    /// row; the default fails.
    fn merge(&self, _first: &Self::Value, _second: &Self::Value) -> Result<Self::Value> {
        bail!(UnsupportedOperation(
            "this output algebra does not support merge".into()
        ))
    }

    /// Serializes a non-empty output to the compiled store.
    fn write(&self, output: &Self::Value, data_out: &mut dyn DataOutput) -> Result<()>;

    /// Deserializes an output previously written with `write`.
    fn read(&self, data_in: &mut dyn DataInput) -> Result<Self::Value>;

    /// Serializes the final output of an arc; by default the same codec as
    /// `write`.
    fn write_final_output(&self, output: &Self::Value, data_out: &mut dyn DataOutput) -> Result<()> {
        self.write(output, data_out)
    }

    /// Mirror of `write_final_output`.
    fn read_final_output(&self, data_in: &mut dyn DataInput) -> Result<Self::Value> {
        self.read(data_in)
    }
}
