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

use std::cmp::max;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;

use crate::core::util::fst::fst_reader::{CompiledAddress, InputType};
use crate::core::util::fst::{OutputFactory, FST};
use crate::core::util::ints_ref::{IntsRef, IntsRefBuilder};
use crate::error::{ErrorKind::IllegalArgument, Result};

/// Builds a minimal FST (maps an IntsRef term to an arbitrary
/// output) from pre-sorted terms with outputs.  The FST
/// becomes an FSA if you use NoOutputs.  The FST is written
/// on-the-fly into a compact serialized format byte array, which can
/// be used directly for traversal.  The FST is always finite (no cycles).
///
/// NOTE: The algorithm is described at
/// http://citeseerx.ist.psu.edu/viewdoc/summary?doi=10.1.1.24.3698
///
/// The output type is decided by the `OutputFactory` the builder is
/// constructed with.  See the implementations in `outputs`.
pub struct FstBuilder<F: OutputFactory> {
    dedup_hash: Option<NodeHash>,
    fst: FST<F>,
    no_output: F::Value,
    // simplistic pruning: we prune node (and all following
    // nodes) if less than this number of terms go through it:
    min_suffix_count1: u32,
    // better pruning: we prune node (and all following
    // nodes) if the prior node has less than this number of
    // terms go through it:
    min_suffix_count2: u32,
    do_share_non_singleton_nodes: bool,
    share_max_tail_length: u32,
    last_input: IntsRefBuilder,
    // for packing
    do_pack_fst: bool,
    acceptable_overhead_ratio: f32,
    // every pending node lives here; the frontier and arc targets refer to
    // them by index, so slots stay stable while their contents are reused
    nodes: Vec<UnCompiledNode<F>>,
    free_nodes: Vec<usize>,
    // current "frontier": the pending node at each depth of the last input
    frontier: Vec<usize>,
    // Used for the BIT_TARGET_NEXT optimization (whereby
    // instead of storing the address of the target node for
    // a given arc, we mark a single bit noting that the next
    // node in the byte[] is the target node):
    last_frozen_node: CompiledAddress,
    freeze_tail_hook: Option<Box<dyn FreezeTail<F>>>,
}

/// Replacement policy for compiling/pruning the suffix of the previous
/// input once a new input diverges from it.  The stock policy is
/// `FstBuilder::default_freeze_tail`; a hook may wrap or replace it.
pub trait FreezeTail<F: OutputFactory> {
    fn freeze(&mut self, builder: &mut FstBuilder<F>, prefix_len_plus1: usize) -> Result<()>;
}

impl<F: OutputFactory> FstBuilder<F> {
    /// Builder with no pruning and full suffix sharing.
    pub fn new(input_type: InputType, outputs: F) -> Self {
        Self::build(
            input_type,
            0,
            0,
            true,
            true,
            u32::max_value(),
            outputs,
            false,
            0.0,
            true,
            15,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn build(
        input_type: InputType,
        min_suffix_count1: u32,
        min_suffix_count2: u32,
        do_share_suffix: bool,
        do_share_non_singleton_nodes: bool,
        share_max_tail_length: u32,
        outputs: F,
        do_pack_fst: bool,
        acceptable_overhead_ratio: f32,
        allow_array_arcs: bool,
        bytes_page_bits: usize,
    ) -> Self {
        let no_output = outputs.empty();
        let fst = FST::new(input_type, outputs, allow_array_arcs, bytes_page_bits);

        let mut builder = FstBuilder {
            dedup_hash: if do_share_suffix {
                Some(NodeHash::new())
            } else {
                None
            },
            fst,
            no_output,
            min_suffix_count1,
            min_suffix_count2,
            do_share_non_singleton_nodes,
            share_max_tail_length,
            last_input: IntsRefBuilder::new(),
            do_pack_fst,
            acceptable_overhead_ratio,
            nodes: Vec::with_capacity(16),
            free_nodes: Vec::new(),
            frontier: Vec::with_capacity(10),
            last_frozen_node: 0,
            freeze_tail_hook: None,
        };
        for depth in 0..10 {
            let node = UnCompiledNode::new(&builder.no_output, depth);
            builder.nodes.push(node);
            builder.frontier.push(depth as usize);
        }
        builder
    }

    /// Installs a custom tail-freezing policy.
    pub fn set_freeze_tail(&mut self, hook: Box<dyn FreezeTail<F>>) {
        self.freeze_tail_hook = Some(hook);
    }

    /// Number of inputs accepted so far.
    pub fn term_count(&self) -> i64 {
        self.nodes[self.frontier[0]].input_count
    }

    pub fn node_count(&self) -> u64 {
        // +1 for the root; the shared end-node sentinels occupy no bytes
        // and are not counted
        self.fst.node_count() + 1
    }

    pub fn arc_count(&self) -> u64 {
        self.fst.arc_count()
    }

    pub fn fst(&self) -> &FST<F> {
        &self.fst
    }

    pub fn last_input(&self) -> &IntsRefBuilder {
        &self.last_input
    }

    fn alloc_node(&mut self, depth: i32) -> usize {
        if let Some(id) = self.free_nodes.pop() {
            self.nodes[id].clear(&self.no_output);
            self.nodes[id].depth = depth;
            id
        } else {
            let node = UnCompiledNode::new(&self.no_output, depth);
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn compile_node(&mut self, node_id: usize, tail_length: u32) -> Result<CompiledAddress> {
        let node: CompiledAddress;
        let bytes_pos_start = self.fst.bytes_store.get_position();

        if let Some(ref mut dedup_hash) = self.dedup_hash {
            if (self.do_share_non_singleton_nodes || self.nodes[node_id].num_arcs <= 1)
                && tail_length <= self.share_max_tail_length
            {
                if self.nodes[node_id].num_arcs == 0 {
                    node = self
                        .fst
                        .add_node(&self.nodes[node_id], self.last_frozen_node)?;
                    self.last_frozen_node = node;
                } else {
                    node = dedup_hash.add(
                        &mut self.fst,
                        &self.nodes[node_id],
                        self.last_frozen_node,
                    )?;
                }
            } else {
                node = self
                    .fst
                    .add_node(&self.nodes[node_id], self.last_frozen_node)?;
            }
        } else {
            node = self
                .fst
                .add_node(&self.nodes[node_id], self.last_frozen_node)?;
        }

        let bytes_pos_end = self.fst.bytes_store.get_position();
        if bytes_pos_end != bytes_pos_start {
            // the fst added a new node
            debug_assert!(bytes_pos_end > bytes_pos_start);
            self.last_frozen_node = node;
        }

        self.nodes[node_id].clear(&self.no_output);
        Ok(node)
    }

    fn freeze_tail(&mut self, prefix_len_plus1: usize) -> Result<()> {
        if self.freeze_tail_hook.is_some() {
            // lift the hook out while it runs so it gets an unaliased
            // builder
            let mut hook = self.freeze_tail_hook.take();
            let result = match hook {
                Some(ref mut h) => h.freeze(self, prefix_len_plus1),
                None => Ok(()),
            };
            self.freeze_tail_hook = hook;
            return result;
        }
        self.default_freeze_tail(prefix_len_plus1)
    }

    /// Compiles or prunes the frontier from the end of the last input down
    /// to (not including) the shared prefix.  Public so a `FreezeTail` hook
    /// can delegate to the stock policy.
    pub fn default_freeze_tail(&mut self, prefix_len_plus1: usize) -> Result<()> {
        let down_to = max(1, prefix_len_plus1);
        if self.last_input.length < down_to {
            return Ok(());
        }

        let mut idx = self.last_input.length;
        while idx >= down_to {
            let mut do_prune = false;
            let do_compile;

            let node_id = self.frontier[idx];
            let parent_id = self.frontier[idx - 1];

            if self.nodes[node_id].input_count < i64::from(self.min_suffix_count1) {
                do_prune = true;
                do_compile = true;
            } else if idx > prefix_len_plus1 {
                // prune if the parent's input count is less than
                // min_suffix_count2
                let parent_count = self.nodes[parent_id].input_count;
                if parent_count < i64::from(self.min_suffix_count2)
                    || (self.min_suffix_count2 == 1 && parent_count == 1 && idx > 1)
                {
                    // my parent, about to be compiled, doesn't make the cut,
                    // so I'm definitely pruned

                    // if min_suffix_count2 is 1, we keep only up
                    // until the 'distinguished edge', ie we keep only the
                    // 'divergent' part of the FST. if my parent, about to be
                    // compiled, has input_count 1 then we are already past the
                    // distinguished edge.  NOTE: this only works if
                    // the FST outputs are not "compressible" (simple
                    // ords ARE compressible):
                    do_prune = true;
                } else {
                    // my parent, about to be compiled, does make the cut, so
                    // I'm definitely not pruned
                    do_prune = false;
                }
                do_compile = true;
            } else {
                // if pruning is disabled (count is 0) we can always
                // compile current node
                do_compile = self.min_suffix_count2 == 0;
            }

            if self.nodes[node_id].input_count < i64::from(self.min_suffix_count2)
                || (self.min_suffix_count2 == 1 && self.nodes[node_id].input_count == 1 && idx > 1)
            {
                // drop all arcs
                let num_arcs = self.nodes[node_id].num_arcs;
                for arc_idx in 0..num_arcs {
                    let target = self.nodes[node_id].arcs[arc_idx].target;
                    if let Node::UnCompiled(target_id) = target {
                        self.nodes[target_id].clear(&self.no_output);
                        self.free_nodes.push(target_id);
                    }
                }
                self.nodes[node_id].num_arcs = 0;
            }

            if do_prune {
                // this node doesn't make it -- deref it
                self.nodes[node_id].clear(&self.no_output);
                let label = self.last_input.int_at(idx - 1);
                self.nodes[parent_id].delete_last(label, Node::UnCompiled(node_id));
            } else {
                if self.min_suffix_count2 != 0 {
                    let tail_len = (self.last_input.length - idx) as u32;
                    self.compile_all_targets(node_id, tail_len)?;
                }
                let next_final_output = self.nodes[node_id].output.clone();
                // we "fake" the node as being final if it has no
                // outgoing arcs; in theory we could leave it
                // as non-final (the FST can represent this), but
                // downstream enumeration has trouble with non-final
                // dead-end states:
                let is_final = self.nodes[node_id].is_final || self.nodes[node_id].num_arcs == 0;
                let label = self.last_input.int_at(idx - 1);

                if do_compile {
                    // this node makes it and we now compile it.  first,
                    // compile any targets that were previously
                    // undecided:
                    let tail_len = (1 + self.last_input.length - idx) as u32;
                    let compiled = self.compile_node(node_id, tail_len)?;
                    self.nodes[parent_id].replace_last(
                        label,
                        Node::Compiled(compiled),
                        next_final_output,
                        is_final,
                    );
                } else {
                    // replace_last just to install
                    // next_final_output/is_final onto the arc
                    self.nodes[parent_id].replace_last(
                        label,
                        Node::UnCompiled(node_id),
                        next_final_output,
                        is_final,
                    );
                    // this node will stay in play for now, since we are
                    // undecided on whether to prune it.  later, it
                    // will be either compiled or pruned, so we must
                    // allocate a new node:
                    let fresh = self.alloc_node(idx as i32);
                    self.frontier[idx] = fresh;
                }
            }
            idx -= 1;
        }
        Ok(())
    }

    fn compile_all_targets(&mut self, node_id: usize, tail_length: u32) -> Result<()> {
        for arc_idx in 0..self.nodes[node_id].num_arcs {
            let target = self.nodes[node_id].arcs[arc_idx].target;
            if let Node::UnCompiled(target_id) = target {
                // not yet compiled
                if self.nodes[target_id].num_arcs == 0 {
                    self.nodes[node_id].arcs[arc_idx].is_final = true;
                    self.nodes[target_id].is_final = true;
                }
                let compiled = self.compile_node(target_id, tail_length - 1)?;
                self.nodes[node_id].arcs[arc_idx].target = Node::Compiled(compiled);
                self.free_nodes.push(target_id);
            }
        }
        Ok(())
    }

    /// Add the next input/output pair.  The provided input
    /// must be sorted after the previous one.  It's also OK to
    /// add the same input twice in a row with different outputs, as
    /// long as the output algebra implements `merge`.  The input is
    /// fully consumed when this method returns, so the caller is free
    /// to reuse its buffer.
    pub fn add(&mut self, input: IntsRef<'_>, output: F::Value) -> Result<()> {
        // caller contract; the empty-input case below carries its own check
        debug_assert!(
            input.length == 0 || self.last_input.length == 0 || input >= self.last_input.get()
        );
        let mut output = output;

        while self.frontier.len() < input.length + 1 {
            let depth = self.frontier.len() as i32;
            let id = self.alloc_node(depth);
            self.frontier.push(id);
        }

        if input.length == 0 {
            // empty input: only allowed as the first input.  we have
            // to special case this because the packed FST
            // format cannot represent the empty input since
            // 'finalness' is stored on the incoming arc, not on
            // the node
            if self.last_input.length > 0 {
                bail!(IllegalArgument(
                    "the empty input is only valid as the first input".into()
                ));
            }
            let root = self.frontier[0];
            self.nodes[root].input_count += 1;
            self.nodes[root].is_final = true;
            self.fst.set_empty_output(output)?;
            return Ok(());
        }

        // compare shared prefix length
        let mut pos1 = 0;
        let mut pos2 = input.offset;
        let pos1_stop = self.last_input.length.min(input.length);
        loop {
            self.nodes[self.frontier[pos1]].input_count += 1;
            if pos1 >= pos1_stop || self.last_input.int_at(pos1) != input.ints[pos2] {
                break;
            }
            pos1 += 1;
            pos2 += 1;
        }
        let prefix_len_plus1 = pos1 + 1;

        // minimize/compile states from previous input's
        // orphan'd suffix
        self.freeze_tail(prefix_len_plus1)?;

        // init tail states for current input
        for idx in prefix_len_plus1..=input.length {
            let target = self.frontier[idx];
            let parent = self.frontier[idx - 1];
            self.nodes[parent].add_arc(
                input.int_at(idx - 1),
                Node::UnCompiled(target),
                &self.no_output,
            );
            self.nodes[target].input_count += 1;
        }

        let last_id = self.frontier[input.length];
        if self.last_input.length != input.length || prefix_len_plus1 != input.length + 1 {
            self.nodes[last_id].is_final = true;
            self.nodes[last_id].output = self.no_output.clone();
        }

        // push conflicting outputs forward, only as far as needed
        for idx in 1..prefix_len_plus1 {
            let label = input.int_at(idx - 1);
            let parent_id = self.frontier[idx - 1];
            let node_id = self.frontier[idx];

            let last_output = self.nodes[parent_id].get_last_output(label).clone();

            let common_output_prefix: F::Value;
            if last_output != self.no_output {
                common_output_prefix = self.fst.outputs().common(&output, &last_output);
                let word_suffix = self
                    .fst
                    .outputs()
                    .subtract(&last_output, &common_output_prefix);
                self.nodes[node_id].prepend_output(self.fst.outputs(), &word_suffix);
            } else {
                common_output_prefix = self.no_output.clone();
            }
            output = self.fst.outputs().subtract(&output, &common_output_prefix);
            if last_output != self.no_output {
                self.nodes[parent_id].set_last_output(label, common_output_prefix);
            }
        }

        if self.last_input.length == input.length && prefix_len_plus1 == input.length + 1 {
            // same input more than 1 time in a row, mapping to
            // multiple outputs
            let merged = self
                .fst
                .outputs()
                .merge(&self.nodes[last_id].output, &output)?;
            self.nodes[last_id].output = merged;
        } else {
            // this new arc is private to this new input; set its
            // arc output to the leftover output:
            let label = input.int_at(prefix_len_plus1 - 1);
            self.nodes[self.frontier[prefix_len_plus1 - 1]].set_last_output(label, output);
        }

        // save last input
        self.last_input.copy_ints_ref(&input);

        Ok(())
    }

    /// Returns the final FST, or `None` if no input survived pruning and no
    /// empty output was recorded.  The builder is consumed: a finished FST
    /// is immutable.
    pub fn finish(mut self) -> Result<Option<FST<F>>> {
        // minimize nodes in the last word's suffix
        self.freeze_tail(0)?;

        let root_id = self.frontier[0];
        if self.nodes[root_id].input_count < i64::from(self.min_suffix_count1)
            || self.nodes[root_id].input_count < i64::from(self.min_suffix_count2)
            || self.nodes[root_id].num_arcs == 0
        {
            if self.fst.empty_output.is_none() {
                return Ok(None);
            } else if self.min_suffix_count1 > 0 || self.min_suffix_count2 > 0 {
                // empty string got pruned
                return Ok(None);
            }
        } else if self.min_suffix_count2 != 0 {
            let tail_len = self.last_input.length as u32;
            self.compile_all_targets(root_id, tail_len)?;
        }

        let tail_len = self.last_input.length as u32;
        let root = self.compile_node(root_id, tail_len)?;
        self.fst.finish(root)?;
        debug!(
            "fst finished: {} nodes, {} arcs, {} bytes",
            self.fst.node_count(),
            self.fst.arc_count(),
            self.fst.bytes_store.get_position()
        );

        let fst = if self.do_pack_fst {
            self.fst.pack(self.acceptable_overhead_ratio)?
        } else {
            self.fst
        };
        Ok(Some(fst))
    }
}

/// An arc of a pending node.  `output` is emitted on traversing the arc;
/// `next_final_output` is emitted when the arc's target ends a key.
pub struct BuilderArc<T> {
    pub label: i32,
    pub target: Node,
    pub is_final: bool,
    pub output: T,
    pub next_final_output: T,
}

impl<T: Clone> Clone for BuilderArc<T> {
    fn clone(&self) -> Self {
        BuilderArc {
            label: self.label,
            target: self.target,
            is_final: self.is_final,
            output: self.output.clone(),
            next_final_output: self.next_final_output.clone(),
        }
    }
}

/// Target of a pending arc: either an already-compiled node (by address)
/// or a pending node (by arena index).
// NOTE: not many pending nodes are in memory while the FST is being
// built; it's only the current "frontier":
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Node {
    Compiled(CompiledAddress),
    UnCompiled(usize),
}

/// Expert: holds a pending (seen but not yet serialized) node.
pub struct UnCompiledNode<F: OutputFactory> {
    pub num_arcs: usize,
    pub arcs: Vec<BuilderArc<F::Value>>,
    // the node's own final output, handed to the incoming arc as
    // next_final_output when the node is frozen
    pub output: F::Value,
    pub is_final: bool,
    pub input_count: i64,
    // This node's depth, starting from the automaton root
    pub depth: i32,
}

impl<F: OutputFactory> UnCompiledNode<F> {
    pub fn new(no_output: &F::Value, depth: i32) -> Self {
        UnCompiledNode {
            num_arcs: 0,
            arcs: Vec::with_capacity(1),
            output: no_output.clone(),
            is_final: false,
            input_count: 0,
            depth,
        }
    }

    pub fn clear(&mut self, no_output: &F::Value) {
        self.num_arcs = 0;
        self.is_final = false;
        self.output = no_output.clone();
        self.input_count = 0;

        // We don't clear the depth here because it never changes
        // for nodes on the frontier (even when reused).
    }

    pub fn get_last_output(&self, label_to_match: i32) -> &F::Value {
        debug_assert!(self.num_arcs > 0);
        debug_assert_eq!(self.arcs[self.num_arcs - 1].label, label_to_match);
        &self.arcs[self.num_arcs - 1].output
    }

    pub fn set_last_output(&mut self, label_to_match: i32, new_output: F::Value) {
        debug_assert!(self.num_arcs > 0);
        debug_assert_eq!(self.arcs[self.num_arcs - 1].label, label_to_match);
        self.arcs[self.num_arcs - 1].output = new_output;
    }

    pub fn add_arc(&mut self, label: i32, target: Node, no_output: &F::Value) {
        debug_assert!(label >= 0);
        debug_assert!(self.num_arcs == 0 || label > self.arcs[self.num_arcs - 1].label);
        debug!("add arc, label: {}", label);
        let new_arc = BuilderArc {
            label,
            target,
            is_final: false,
            output: no_output.clone(),
            next_final_output: no_output.clone(),
        };
        if self.num_arcs == self.arcs.len() {
            self.arcs.push(new_arc);
        } else {
            self.arcs[self.num_arcs] = new_arc;
        }
        self.num_arcs += 1;
    }

    pub fn replace_last(
        &mut self,
        label_to_match: i32,
        target: Node,
        next_final_output: F::Value,
        is_final: bool,
    ) {
        debug_assert!(self.num_arcs > 0);
        let arc = &mut self.arcs[self.num_arcs - 1];
        debug_assert_eq!(arc.label, label_to_match);
        arc.target = target;
        arc.next_final_output = next_final_output;
        arc.is_final = is_final;
    }

    pub fn delete_last(&mut self, label: i32, target: Node) {
        debug_assert!(self.num_arcs > 0);
        debug_assert_eq!(self.arcs[self.num_arcs - 1].label, label);
        debug_assert_eq!(self.arcs[self.num_arcs - 1].target, target);
        self.num_arcs -= 1;
    }

    pub fn prepend_output(&mut self, outputs: &F, output_prefix: &F::Value) {
        for arc_idx in 0..self.num_arcs {
            self.arcs[arc_idx].output = outputs.add(output_prefix, &self.arcs[arc_idx].output);
        }
        if self.is_final {
            self.output = outputs.add(output_prefix, &self.output);
        }
    }
}

/// Used to dedup states (lookup already-frozen states): open addressing
/// over compiled addresses with quadratic probing; zero means empty, since
/// no real node lives at the padded address 0.
struct NodeHash {
    table: Vec<i64>,
    count: usize,
    mask: usize,
}

impl NodeHash {
    pub fn new() -> Self {
        NodeHash {
            table: vec![0; 16],
            count: 0,
            mask: 15,
        }
    }

    fn hash_code<T: Hash>(v: &T) -> u64 {
        let mut state = DefaultHasher::new();
        v.hash(&mut state);
        state.finish()
    }

    fn node_hash_uncompiled<F: OutputFactory>(node: &UnCompiledNode<F>) -> u64 {
        let prime = 31u64;
        let mut h = 0u64;
        for arc in &node.arcs[0..node.num_arcs] {
            h = prime.wrapping_mul(h).wrapping_add(arc.label as u64);
            let target = match arc.target {
                Node::Compiled(address) => address,
                // freeze_tail compiles all targets before dedup
                Node::UnCompiled(_) => unreachable!("dedup over uncompiled target"),
            };
            h = prime
                .wrapping_mul(h)
                .wrapping_add((target ^ (target >> 32)) as u64);
            h = prime
                .wrapping_mul(h)
                .wrapping_add(Self::hash_code(&arc.output));
            h = prime
                .wrapping_mul(h)
                .wrapping_add(Self::hash_code(&arc.next_final_output));
            if arc.is_final {
                h = h.wrapping_add(17);
            }
        }
        h
    }

    fn node_hash_compiled<F: OutputFactory>(fst: &FST<F>, node: CompiledAddress) -> Result<u64> {
        let prime = 31u64;
        let mut h = 0u64;
        let mut input = fst.bytes_reader();
        let mut arc = fst.read_first_real_target_arc(node, &mut input)?;
        loop {
            h = prime.wrapping_mul(h).wrapping_add(arc.label as u64);
            h = prime
                .wrapping_mul(h)
                .wrapping_add((arc.target ^ (arc.target >> 32)) as u64);
            h = prime
                .wrapping_mul(h)
                .wrapping_add(Self::hash_code(&arc.output));
            h = prime
                .wrapping_mul(h)
                .wrapping_add(Self::hash_code(&arc.next_final_output));
            if arc.is_final() {
                h = h.wrapping_add(17);
            }
            if arc.is_last() {
                break;
            }
            fst.read_next_real_arc(&mut arc, &mut input)?;
        }
        Ok(h)
    }

    fn nodes_equal<F: OutputFactory>(
        fst: &FST<F>,
        node: &UnCompiledNode<F>,
        address: CompiledAddress,
    ) -> Result<bool> {
        let mut input = fst.bytes_reader();
        let mut scratch_arc = fst.read_first_real_target_arc(address, &mut input)?;
        for arc_idx in 0..node.num_arcs {
            let arc = &node.arcs[arc_idx];
            if arc.label != scratch_arc.label
                || arc.is_final != scratch_arc.is_final()
                || arc.output != scratch_arc.output
                || arc.next_final_output != scratch_arc.next_final_output
            {
                return Ok(false);
            }
            match arc.target {
                Node::Compiled(address) => {
                    if address != scratch_arc.target {
                        return Ok(false);
                    }
                }
                Node::UnCompiled(_) => return Ok(false),
            }
            if scratch_arc.is_last() {
                return Ok(arc_idx == node.num_arcs - 1);
            }
            fst.read_next_real_arc(&mut scratch_arc, &mut input)?;
        }
        Ok(false)
    }

    pub fn add<F: OutputFactory>(
        &mut self,
        fst: &mut FST<F>,
        node_in: &UnCompiledNode<F>,
        last_frozen_node: CompiledAddress,
    ) -> Result<CompiledAddress> {
        let h = Self::node_hash_uncompiled(node_in);
        let mut pos = h as usize & self.mask;
        let mut c = 0usize;
        loop {
            let v = self.table[pos];
            if v == 0 {
                // freeze & add
                let node = fst.add_node(node_in, last_frozen_node)?;
                #[cfg(debug_assertions)]
                {
                    debug_assert_eq!(Self::node_hash_compiled(&*fst, node)?, h);
                }
                self.count += 1;
                self.table[pos] = node;
                // rehash at 2/3 occupancy:
                if self.count > 2 * self.table.len() / 3 {
                    self.rehash(fst)?;
                }
                return Ok(node);
            } else if Self::nodes_equal(fst, node_in, v)? {
                // same node is already here
                return Ok(v);
            }

            // quadratic probe
            c += 1;
            pos = (pos + c) & self.mask;
        }
    }

    fn rehash<F: OutputFactory>(&mut self, fst: &FST<F>) -> Result<()> {
        let new_size = 2 * self.table.len();
        let old_table = mem::replace(&mut self.table, vec![0; new_size]);
        self.mask = new_size - 1;
        for &address in &old_table {
            if address != 0 {
                let mut pos = Self::node_hash_compiled(fst, address)? as usize & self.mask;
                let mut c = 0usize;
                loop {
                    if self.table[pos] == 0 {
                        self.table[pos] = address;
                        break;
                    }
                    // quadratic probe
                    c += 1;
                    pos = (pos + c) & self.mask;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::util::fst::{
        ByteSequenceOutputs, BytesRefFstEnum, NoOutputs, PositiveIntOutputs,
    };

    fn add_bytes<F: OutputFactory>(
        builder: &mut FstBuilder<F>,
        key: &[u8],
        output: F::Value,
    ) -> Result<()> {
        let ints: Vec<i32> = key.iter().map(|&b| i32::from(b)).collect();
        builder.add(IntsRef::new(&ints), output)
    }

    #[test]
    fn empty_input_only() {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        builder.add(IntsRef::new(&[]), 7).unwrap();
        let fst = builder.finish().unwrap().expect("fst should survive");

        let mut iter = BytesRefFstEnum::new(&fst);
        let entry = iter.next().unwrap().expect("one entry");
        assert_eq!(entry.input, Vec::<u8>::new());
        assert_eq!(entry.output, 7);
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn empty_input_after_nonempty_is_rejected() {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        add_bytes(&mut builder, &[1], 1).unwrap();
        assert!(builder.add(IntsRef::new(&[]), 7).is_err());
    }

    #[test]
    fn three_chained_keys_without_outputs() {
        let mut builder = FstBuilder::new(InputType::Byte1, NoOutputs);
        add_bytes(&mut builder, &[1], ()).unwrap();
        add_bytes(&mut builder, &[1, 2], ()).unwrap();
        add_bytes(&mut builder, &[1, 2, 3], ()).unwrap();
        assert_eq!(builder.term_count(), 3);
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        assert_eq!(iter.next().unwrap().unwrap().input, vec![1]);
        assert_eq!(iter.next().unwrap().unwrap().input, vec![1, 2]);
        assert_eq!(iter.next().unwrap().unwrap().input, vec![1, 2, 3]);
        assert!(iter.next().unwrap().is_none());
        // a chain of three keys compiles to at most four states
        assert!(fst.node_count() <= 4);
    }

    #[test]
    fn shared_suffix_is_deduped() {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        add_bytes(&mut builder, &[1, 5], 0).unwrap();
        add_bytes(&mut builder, &[2, 5], 0).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        let mut reader = fst.bytes_reader();
        let root = fst.first_arc();
        let arc1 = fst.read_first_target_arc(&root, &mut reader).unwrap();
        assert_eq!(arc1.label, 1);
        let mut arc2 = arc1.clone();
        fst.read_next_arc(&mut arc2, &mut reader).unwrap();
        assert_eq!(arc2.label, 2);
        // both 5-arcs lead to the same compiled handle
        assert_eq!(arc1.target, arc2.target);
    }

    #[test]
    fn deep_shared_suffix_is_deduped() {
        // [1,7,8,9] and [2,7,8,9] share their whole tail; with sharing on,
        // the suffix chain must exist only once
        let mut with_sharing = FstBuilder::new(InputType::Byte1, NoOutputs);
        add_bytes(&mut with_sharing, &[1, 7, 8, 9], ()).unwrap();
        add_bytes(&mut with_sharing, &[2, 7, 8, 9], ()).unwrap();
        let shared = with_sharing.finish().unwrap().unwrap();

        let mut without_sharing = FstBuilder::build(
            InputType::Byte1,
            0,
            0,
            false,
            true,
            u32::max_value(),
            NoOutputs,
            false,
            0.0,
            true,
            15,
        );
        add_bytes(&mut without_sharing, &[1, 7, 8, 9], ()).unwrap();
        add_bytes(&mut without_sharing, &[2, 7, 8, 9], ()).unwrap();
        let unshared = without_sharing.finish().unwrap().unwrap();

        assert!(shared.node_count() < unshared.node_count());

        // both still enumerate the same keys
        for fst in &[shared, unshared] {
            let mut iter = BytesRefFstEnum::new(fst);
            assert_eq!(iter.next().unwrap().unwrap().input, vec![1, 7, 8, 9]);
            assert_eq!(iter.next().unwrap().unwrap().input, vec![2, 7, 8, 9]);
            assert!(iter.next().unwrap().is_none());
        }
    }

    #[test]
    fn outputs_are_pushed_forward() {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        add_bytes(&mut builder, &[1, 2], 10).unwrap();
        add_bytes(&mut builder, &[1, 3], 4).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        // the shared 1-arc carries common(10, 4) = 4
        let mut reader = fst.bytes_reader();
        let root = fst.first_arc();
        let arc1 = fst.read_first_target_arc(&root, &mut reader).unwrap();
        assert_eq!(arc1.label, 1);
        assert_eq!(arc1.output, 4);
        let arc2 = fst
            .read_first_real_target_arc(arc1.target, &mut reader)
            .unwrap();
        assert_eq!(arc2.label, 2);
        assert_eq!(arc2.output, 6);
        let mut arc3 = arc2.clone();
        fst.read_next_arc(&mut arc3, &mut reader).unwrap();
        assert_eq!(arc3.label, 3);
        assert_eq!(arc3.output, 0);

        // per-key totals are preserved
        let mut iter = BytesRefFstEnum::new(&fst);
        let first = iter.next().unwrap().unwrap();
        assert_eq!((first.input, first.output), (vec![1, 2], 10));
        let second = iter.next().unwrap().unwrap();
        assert_eq!((second.input, second.output), (vec![1, 3], 4));
    }

    #[test]
    fn byte_sequence_outputs_round_trip() {
        let mut builder = FstBuilder::new(InputType::Byte1, ByteSequenceOutputs);
        add_bytes(&mut builder, b"cat", b"feline".to_vec()).unwrap();
        add_bytes(&mut builder, b"cow", b"fell".to_vec()).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.input, b"cat".to_vec());
        assert_eq!(first.output, b"feline".to_vec());
        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.input, b"cow".to_vec());
        assert_eq!(second.output, b"fell".to_vec());
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn low_count_suffixes_are_pruned() {
        let mut builder = FstBuilder::build(
            InputType::Byte1,
            2,
            0,
            true,
            true,
            u32::max_value(),
            NoOutputs,
            false,
            0.0,
            true,
            15,
        );
        add_bytes(&mut builder, &[1, 2], ()).unwrap();
        add_bytes(&mut builder, &[1, 3], ()).unwrap();
        add_bytes(&mut builder, &[1, 3], ()).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        assert_eq!(iter.next().unwrap().unwrap().input, vec![1, 3]);
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn nothing_survives_pruning() {
        let mut builder = FstBuilder::build(
            InputType::Byte1,
            2,
            0,
            true,
            true,
            u32::max_value(),
            NoOutputs,
            false,
            0.0,
            true,
            15,
        );
        add_bytes(&mut builder, &[1, 2], ()).unwrap();
        assert!(builder.finish().unwrap().is_none());
    }

    #[test]
    fn empty_builder_yields_no_fst() {
        let builder = FstBuilder::new(InputType::Byte1, NoOutputs);
        assert!(builder.finish().unwrap().is_none());
    }

    #[test]
    fn duplicate_input_without_merge_fails() {
        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        add_bytes(&mut builder, &[1, 2], 5).unwrap();
        assert!(add_bytes(&mut builder, &[1, 2], 9).is_err());
    }

    #[test]
    fn label_out_of_byte_range_fails() {
        let mut builder = FstBuilder::new(InputType::Byte1, NoOutputs);
        builder.add(IntsRef::new(&[300]), ()).unwrap();
        assert!(builder.finish().is_err());
    }

    #[test]
    fn wide_labels_fit_wider_input_types() {
        let mut builder = FstBuilder::new(InputType::Byte4, PositiveIntOutputs);
        builder.add(IntsRef::new(&[0x1f600]), 3).unwrap();
        builder.add(IntsRef::new(&[0x1f600, 0x1f601]), 9).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        // walk with the raw arc reader; the byte enumerator only covers
        // single-byte labels
        let mut reader = fst.bytes_reader();
        let root = fst.first_arc();
        let arc = fst.read_first_target_arc(&root, &mut reader).unwrap();
        assert_eq!(arc.label, 0x1f600);
        assert_eq!(arc.output, 3);
    }

    #[test]
    fn keep_only_divergent_part() {
        // min_suffix_count2 == 1 keeps each key only up to its
        // distinguishing edge (sound here because NoOutputs is not
        // compressible)
        let mut builder = FstBuilder::build(
            InputType::Byte1,
            0,
            1,
            true,
            true,
            u32::max_value(),
            NoOutputs,
            false,
            0.0,
            true,
            15,
        );
        add_bytes(&mut builder, &[1, 2, 3], ()).unwrap();
        add_bytes(&mut builder, &[1, 5, 6], ()).unwrap();
        add_bytes(&mut builder, &[1, 5, 9], ()).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        let mut keys = Vec::new();
        while let Some(entry) = iter.next().unwrap() {
            keys.push(entry.input);
        }
        // [1,2,3] truncates right after its first divergent edge; the
        // [1,5,*] pair stays distinct one level deeper
        assert_eq!(keys, vec![vec![1, 2], vec![1, 5, 6], vec![1, 5, 9]]);
    }

    #[test]
    fn do_pack_fst_compacts_the_store() {
        let mut builder = FstBuilder::build(
            InputType::Byte1,
            0,
            0,
            true,
            true,
            u32::max_value(),
            PositiveIntOutputs,
            true,
            0.0,
            true,
            4, // tiny pages so several blocks exist
        );
        for key in 1..=60u8 {
            add_bytes(&mut builder, &[key, key / 2, key / 3], i64::from(key)).unwrap();
        }
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        let mut count = 0;
        while let Some(entry) = iter.next().unwrap() {
            assert_eq!(entry.output, i64::from(entry.input[0]));
            count += 1;
        }
        assert_eq!(count, 60);
    }

    #[test]
    fn freeze_tail_hook_can_delegate() {
        struct StockPolicy;

        impl FreezeTail<PositiveIntOutputs> for StockPolicy {
            fn freeze(
                &mut self,
                builder: &mut FstBuilder<PositiveIntOutputs>,
                prefix_len_plus1: usize,
            ) -> Result<()> {
                builder.default_freeze_tail(prefix_len_plus1)
            }
        }

        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        builder.set_freeze_tail(Box::new(StockPolicy));
        add_bytes(&mut builder, &[1, 2], 10).unwrap();
        add_bytes(&mut builder, &[1, 3], 4).unwrap();
        let fst = builder.finish().unwrap().unwrap();

        let mut iter = BytesRefFstEnum::new(&fst);
        let first = iter.next().unwrap().unwrap();
        assert_eq!((first.input, first.output), (vec![1, 2], 10));
        let second = iter.next().unwrap().unwrap();
        assert_eq!((second.input, second.output), (vec![1, 3], 4));
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn random_sorted_round_trip() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::collections::BTreeMap;

        let mut rng = StdRng::seed_from_u64(17);
        let mut expected: std::collections::BTreeMap<Vec<u8>, i64> = BTreeMap::new();
        while expected.len() < 300 {
            let len = rng.gen_range(1, 9);
            let key: Vec<u8> = (0..len).map(|_| rng.gen_range(0, 8) as u8).collect();
            let output = rng.gen_range(1, 1_000_000i64);
            expected.entry(key).or_insert(output);
        }

        let mut builder = FstBuilder::new(InputType::Byte1, PositiveIntOutputs);
        for (key, &output) in &expected {
            add_bytes(&mut builder, key, output).unwrap();
        }
        assert_eq!(builder.term_count(), expected.len() as i64);
        let fst = builder.finish().unwrap().unwrap();

        // enumeration replays the sorted input exactly
        let mut iter = BytesRefFstEnum::new(&fst);
        for (key, &output) in &expected {
            let entry = iter.next().unwrap().expect("missing entry");
            assert_eq!(&entry.input, key);
            assert_eq!(entry.output, output);
        }
        assert!(iter.next().unwrap().is_none());

        // every key is found exactly, and a near miss is not
        let mut iter = BytesRefFstEnum::new(&fst);
        for (key, &output) in &expected {
            let entry = iter.seek_exact(key).unwrap().expect("seek_exact miss");
            assert_eq!(entry.output, output);
        }
        assert!(iter.seek_exact(&[9, 9, 9]).unwrap().is_none());
    }
}
