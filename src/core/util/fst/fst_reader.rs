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

use crate::core::store::{DataInput, DataOutput};
use crate::core::util::fst::fst_builder::{Node, UnCompiledNode};
use crate::core::util::fst::{BytesStore, OutputFactory, StoreBytesReader};
use crate::error::{
    ErrorKind::{IllegalArgument, IllegalState},
    Result,
};

/// Address of a compiled node: the offset of its last byte in the store.
pub type CompiledAddress = i64;

/// Reserved label of the implicit accepting transition out of a final
/// node.  Never a valid input label.
pub const END_LABEL: i32 = -1;

/// Sentinel address of the final node with no outgoing arcs.
pub const FINAL_END_NODE: CompiledAddress = -1;

/// Sentinel address of the non-final node with no outgoing arcs.
pub const NON_FINAL_END_NODE: CompiledAddress = 0;

const BIT_FINAL_ARC: u8 = 1;
const BIT_LAST_ARC: u8 = 1 << 1;
const BIT_TARGET_NEXT: u8 = 1 << 2;
const BIT_STOP_NODE: u8 = 1 << 3;
const BIT_ARC_HAS_OUTPUT: u8 = 1 << 4;
const BIT_ARC_HAS_FINAL_OUTPUT: u8 = 1 << 5;

/// Width of the input labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputType {
    /// Labels are bytes, 0..=255.
    Byte1,
    /// Labels are shorts, 0..=65535.
    Byte2,
    /// Labels are 21-bit code points.
    Byte4,
}

const MAX_BYTE4_LABEL: i32 = 0x001f_ffff;

/// One transition of a compiled node, decoded into memory.  `next_arc` is
/// the address the reader continues from to reach the following arc of the
/// same node (or, on the faked final arc, the node holding the real arcs).
#[derive(Clone, Debug)]
pub struct FstArc<T> {
    pub label: i32,
    pub output: T,
    pub target: CompiledAddress,
    pub next_final_output: T,
    pub flags: u8,
    pub next_arc: CompiledAddress,
}

impl<T: Clone> FstArc<T> {
    pub(crate) fn empty(no_output: T) -> FstArc<T> {
        FstArc {
            label: 0,
            output: no_output.clone(),
            target: 0,
            next_final_output: no_output,
            flags: 0,
            next_arc: 0,
        }
    }

    pub fn is_last(&self) -> bool {
        self.flag(BIT_LAST_ARC)
    }

    pub fn is_final(&self) -> bool {
        self.flag(BIT_FINAL_ARC)
    }

    fn flag(&self, f: u8) -> bool {
        self.flags & f != 0
    }
}

/// A compiled FST: the serialized nodes plus the entry point.  Nodes are
/// immutable once written; `FstBuilder` is the only writer.
pub struct FST<F: OutputFactory> {
    pub input_type: InputType,
    pub bytes_store: BytesStore,
    outputs: F,
    no_output: F::Value,
    pub start_node: CompiledAddress,
    pub empty_output: Option<F::Value>,
    node_count: u64,
    arc_count: u64,
    /// Recorded for the serialized form; the in-memory store always lays
    /// arcs out as a linear list.
    pub allow_array_arcs: bool,
}

impl<F: OutputFactory> FST<F> {
    pub fn new(
        input_type: InputType,
        outputs: F,
        allow_array_arcs: bool,
        bytes_page_bits: usize,
    ) -> FST<F> {
        let no_output = outputs.empty();
        let mut bytes_store = BytesStore::with_block_bits(bytes_page_bits);
        // pad: ensure no node gets address 0, which is reserved to mean
        // the stop state with no arcs
        bytes_store.push_byte(0);
        FST {
            input_type,
            bytes_store,
            outputs,
            no_output,
            start_node: -1,
            empty_output: None,
            node_count: 0,
            arc_count: 0,
            allow_array_arcs,
        }
    }

    pub fn outputs(&self) -> &F {
        &self.outputs
    }

    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn arc_count(&self) -> u64 {
        self.arc_count
    }

    /// Output mapped from the empty input, stored outside the byte format
    /// because finalness lives on incoming arcs and the empty input has
    /// none.
    pub(crate) fn set_empty_output(&mut self, v: F::Value) -> Result<()> {
        let merged = match self.empty_output.take() {
            Some(current) => self.outputs.merge(&current, &v)?,
            None => v,
        };
        self.empty_output = Some(merged);
        Ok(())
    }

    /// Installs the compiled root and freezes the store.
    pub(crate) fn finish(&mut self, new_start_node: CompiledAddress) -> Result<()> {
        if self.start_node != -1 {
            bail!(IllegalState("already finished".into()));
        }
        self.start_node = if new_start_node == FINAL_END_NODE && self.empty_output.is_some() {
            0
        } else {
            new_start_node
        };
        self.bytes_store.finish();
        Ok(())
    }

    /// Post-finish packing pass: compacts the byte store.  The
    /// packed-integer node relabeling of the serialized format is the
    /// serializer's concern, not this store's.
    pub fn pack(mut self, acceptable_overhead_ratio: f32) -> Result<FST<F>> {
        if self.start_node == -1 {
            bail!(IllegalState("cannot pack an unfinished fst".into()));
        }
        self.bytes_store.compact(acceptable_overhead_ratio);
        Ok(self)
    }

    fn write_label(&mut self, label: i32) -> Result<()> {
        if label < 0 {
            bail!(IllegalArgument(format!(
                "label must be non-negative, got {}",
                label
            )));
        }
        match self.input_type {
            InputType::Byte1 => {
                if label > 0xff {
                    bail!(IllegalArgument(format!(
                        "label {} is out of range for byte input",
                        label
                    )));
                }
                self.bytes_store.write_byte(label as u8)
            }
            InputType::Byte2 => {
                if label > 0xffff {
                    bail!(IllegalArgument(format!(
                        "label {} is out of range for short input",
                        label
                    )));
                }
                self.bytes_store.write_short(label as i16)
            }
            InputType::Byte4 => {
                if label > MAX_BYTE4_LABEL {
                    bail!(IllegalArgument(format!(
                        "label {} is out of range for code point input",
                        label
                    )));
                }
                self.bytes_store.write_vint(label)
            }
        }
    }

    fn read_label(&self, input: &mut StoreBytesReader<'_>) -> Result<i32> {
        match self.input_type {
            InputType::Byte1 => Ok(i32::from(input.read_byte()?)),
            InputType::Byte2 => Ok(i32::from(input.read_short()? as u16)),
            InputType::Byte4 => input.read_vint(),
        }
    }

    pub fn target_has_arcs(arc: &FstArc<F::Value>) -> bool {
        arc.target > 0
    }

    /// Serializes a frozen node whose targets have all been compiled and
    /// returns its address.  Nodes without arcs map to the shared end-node
    /// sentinels and occupy no bytes.
    ///
    /// `last_frozen_node` is the address of the node most recently written
    /// to the store; an arc targeting it skips the target address entirely
    /// (the reader finds the target right past this node's bytes).
    pub(crate) fn add_node(
        &mut self,
        node_in: &UnCompiledNode<F>,
        last_frozen_node: CompiledAddress,
    ) -> Result<CompiledAddress> {
        if node_in.num_arcs == 0 {
            return Ok(if node_in.is_final {
                FINAL_END_NODE
            } else {
                NON_FINAL_END_NODE
            });
        }

        let start_address = self.bytes_store.get_position();
        let last_arc = node_in.num_arcs - 1;
        for arc_idx in 0..node_in.num_arcs {
            let arc = &node_in.arcs[arc_idx];
            let target = match arc.target {
                Node::Compiled(address) => address,
                Node::UnCompiled(_) => bail!(IllegalState(
                    "cannot serialize a node with uncompiled targets".into()
                )),
            };

            let mut flags = 0u8;
            if arc_idx == last_arc {
                flags |= BIT_LAST_ARC;
            }
            if last_frozen_node == target {
                flags |= BIT_TARGET_NEXT;
            }
            if arc.is_final {
                flags |= BIT_FINAL_ARC;
                if arc.next_final_output != self.no_output {
                    flags |= BIT_ARC_HAS_FINAL_OUTPUT;
                }
            } else {
                debug_assert!(arc.next_final_output == self.no_output);
            }
            let target_has_arcs = target > 0;
            if !target_has_arcs {
                flags |= BIT_STOP_NODE;
            }
            if arc.output != self.no_output {
                flags |= BIT_ARC_HAS_OUTPUT;
            }

            self.bytes_store.write_byte(flags)?;
            self.write_label(arc.label)?;
            if arc.output != self.no_output {
                self.outputs.write(&arc.output, &mut self.bytes_store)?;
            }
            if flags & BIT_ARC_HAS_FINAL_OUTPUT != 0 {
                self.outputs
                    .write_final_output(&arc.next_final_output, &mut self.bytes_store)?;
            }
            if target_has_arcs && flags & BIT_TARGET_NEXT == 0 {
                self.bytes_store.write_vlong(target)?;
            }
            self.arc_count += 1;
        }

        let this_node_address = (self.bytes_store.get_position() - 1) as CompiledAddress;
        self.bytes_store
            .reverse(start_address, this_node_address as usize);
        self.node_count += 1;
        Ok(this_node_address)
    }

    /// The virtual arc entering the root; `target` is the start node and
    /// the empty output, if any, rides along as the final output.
    pub fn first_arc(&self) -> FstArc<F::Value> {
        debug_assert!(self.start_node != -1);
        let mut arc = FstArc::empty(self.no_output.clone());
        if let Some(ref empty_output) = self.empty_output {
            arc.flags = BIT_FINAL_ARC | BIT_LAST_ARC;
            arc.next_final_output = empty_output.clone();
            if *empty_output != self.no_output {
                arc.flags |= BIT_ARC_HAS_FINAL_OUTPUT;
            }
        } else {
            arc.flags = BIT_LAST_ARC;
        }
        // if the FST accepts only the empty input, start_node is 0
        arc.target = self.start_node;
        arc
    }

    pub fn bytes_reader(&self) -> StoreBytesReader<'_> {
        self.bytes_store.get_reverse_reader()
    }

    /// First outgoing arc of `follow`'s target.  A final target is entered
    /// through a faked `END_LABEL` arc carrying the final output, so
    /// enumeration sees the accepted prefix before any longer key.
    pub fn read_first_target_arc(
        &self,
        follow: &FstArc<F::Value>,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<FstArc<F::Value>> {
        if follow.is_final() {
            let mut arc = FstArc::empty(self.no_output.clone());
            arc.label = END_LABEL;
            arc.output = follow.next_final_output.clone();
            arc.flags = BIT_FINAL_ARC;
            if follow.target <= 0 {
                arc.flags |= BIT_LAST_ARC;
            } else {
                // next_arc is a node address, not an arc address, here
                arc.next_arc = follow.target;
            }
            arc.target = FINAL_END_NODE;
            Ok(arc)
        } else {
            self.read_first_real_target_arc(follow.target, input)
        }
    }

    pub fn read_first_real_target_arc(
        &self,
        node: CompiledAddress,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<FstArc<F::Value>> {
        let mut arc = FstArc::empty(self.no_output.clone());
        arc.next_arc = node;
        self.read_next_real_arc(&mut arc, input)?;
        Ok(arc)
    }

    pub fn read_next_arc(
        &self,
        arc: &mut FstArc<F::Value>,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<()> {
        if arc.label == END_LABEL {
            // this was the faked final arc
            if arc.next_arc <= 0 {
                bail!(IllegalArgument(
                    "cannot read the next arc when arc.is_last()".into()
                ));
            }
            *arc = self.read_first_real_target_arc(arc.next_arc, input)?;
            Ok(())
        } else {
            self.read_next_real_arc(arc, input)
        }
    }

    /// Peeks at the label of the arc following `arc` without disturbing it.
    pub fn read_next_arc_label(
        &self,
        arc: &FstArc<F::Value>,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<i32> {
        debug_assert!(!arc.is_last());
        // on the faked final arc, next_arc is the node whose first real arc
        // comes next; otherwise it is the following arc itself
        input.set_position(arc.next_arc);
        input.read_byte()?; // flags
        self.read_label(input)
    }

    pub fn read_next_real_arc(
        &self,
        arc: &mut FstArc<F::Value>,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<()> {
        input.set_position(arc.next_arc);
        arc.flags = input.read_byte()?;
        arc.label = self.read_label(input)?;
        arc.output = if arc.flag(BIT_ARC_HAS_OUTPUT) {
            self.outputs.read(input)?
        } else {
            self.no_output.clone()
        };
        arc.next_final_output = if arc.flag(BIT_ARC_HAS_FINAL_OUTPUT) {
            self.outputs.read_final_output(input)?
        } else {
            self.no_output.clone()
        };
        if arc.flag(BIT_STOP_NODE) {
            arc.target = if arc.is_final() {
                FINAL_END_NODE
            } else {
                NON_FINAL_END_NODE
            };
            arc.next_arc = input.position();
        } else if arc.flag(BIT_TARGET_NEXT) {
            arc.next_arc = input.position();
            // the target node was written right before this one, so it
            // starts where this node's remaining arcs end
            if !arc.is_last() {
                self.seek_to_next_node(input)?;
            }
            arc.target = input.position();
        } else {
            arc.target = input.read_vlong()?;
            arc.next_arc = input.position();
        }
        Ok(())
    }

    /// Last outgoing arc of `follow`'s target, used by floor seeks.
    pub fn read_last_target_arc(
        &self,
        follow: &FstArc<F::Value>,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<FstArc<F::Value>> {
        if !Self::target_has_arcs(follow) {
            debug_assert!(follow.is_final());
            let mut arc = FstArc::empty(self.no_output.clone());
            arc.label = END_LABEL;
            arc.target = FINAL_END_NODE;
            arc.output = follow.next_final_output.clone();
            arc.flags = BIT_LAST_ARC | BIT_FINAL_ARC;
            Ok(arc)
        } else {
            let mut arc = self.read_first_real_target_arc(follow.target, input)?;
            while !arc.is_last() {
                self.read_next_real_arc(&mut arc, input)?;
            }
            Ok(arc)
        }
    }

    /// Looks up the outgoing arc of `follow`'s target labeled
    /// `label_to_match`, short-circuiting as soon as the sorted arc list
    /// passes the label.
    pub fn find_target_arc(
        &self,
        label_to_match: i32,
        follow: &FstArc<F::Value>,
        input: &mut StoreBytesReader<'_>,
    ) -> Result<Option<FstArc<F::Value>>> {
        if label_to_match == END_LABEL {
            if follow.is_final() {
                let mut arc = FstArc::empty(self.no_output.clone());
                if follow.target <= 0 {
                    arc.flags = BIT_LAST_ARC;
                } else {
                    // next_arc is a node address here, as in
                    // read_first_target_arc
                    arc.next_arc = follow.target;
                }
                arc.output = follow.next_final_output.clone();
                arc.label = END_LABEL;
                arc.flags |= BIT_FINAL_ARC;
                arc.target = FINAL_END_NODE;
                return Ok(Some(arc));
            }
            return Ok(None);
        }
        if !Self::target_has_arcs(follow) {
            return Ok(None);
        }
        let mut arc = self.read_first_real_target_arc(follow.target, input)?;
        loop {
            if arc.label == label_to_match {
                return Ok(Some(arc));
            } else if arc.label > label_to_match || arc.is_last() {
                return Ok(None);
            }
            self.read_next_real_arc(&mut arc, input)?;
        }
    }

    fn seek_to_next_node(&self, input: &mut StoreBytesReader<'_>) -> Result<()> {
        loop {
            let flags = input.read_byte()?;
            self.read_label(input)?;
            if flags & BIT_ARC_HAS_OUTPUT != 0 {
                self.outputs.read(input)?;
            }
            if flags & BIT_ARC_HAS_FINAL_OUTPUT != 0 {
                self.outputs.read_final_output(input)?;
            }
            if flags & BIT_STOP_NODE == 0 && flags & BIT_TARGET_NEXT == 0 {
                input.read_vlong()?;
            }
            if flags & BIT_LAST_ARC != 0 {
                return Ok(());
            }
        }
    }
}
