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
use crate::error::{ErrorKind::IllegalState, Result};

/// Append-only byte buffer split into fixed-size pages of `1 <<
/// block_bits` bytes, so the compiled FST can grow past a single
/// allocation without copying.
///
/// Compiled nodes are written forward and then `reverse`d in place, which
/// lets the reverse reader hand the bytes back in arc order while node
/// addresses stay "address of the node's last byte".
pub struct BytesStore {
    block_bits: usize,
    block_size: usize,
    block_mask: usize,
    blocks: Vec<Vec<u8>>,
    // write offset into the last block
    upto: usize,
}

impl BytesStore {
    pub fn with_block_bits(block_bits: usize) -> BytesStore {
        debug_assert!(block_bits >= 1 && block_bits <= 30);
        let block_size = 1usize << block_bits;
        BytesStore {
            block_bits,
            block_size,
            block_mask: block_size - 1,
            blocks: vec![vec![0u8; block_size]],
            upto: 0,
        }
    }

    /// Absolute write position, which is also the number of bytes written.
    pub fn get_position(&self) -> usize {
        (self.blocks.len() - 1) * self.block_size + self.upto
    }

    pub fn push_byte(&mut self, b: u8) {
        if self.upto == self.block_size {
            self.blocks.push(vec![0u8; self.block_size]);
            self.upto = 0;
        }
        let last = self.blocks.len() - 1;
        self.blocks[last][self.upto] = b;
        self.upto += 1;
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let mut offset = 0;
        while offset < bytes.len() {
            if self.upto == self.block_size {
                self.blocks.push(vec![0u8; self.block_size]);
                self.upto = 0;
            }
            let last = self.blocks.len() - 1;
            let chunk = (self.block_size - self.upto).min(bytes.len() - offset);
            self.blocks[last][self.upto..self.upto + chunk]
                .copy_from_slice(&bytes[offset..offset + chunk]);
            self.upto += chunk;
            offset += chunk;
        }
    }

    pub fn get_byte(&self, pos: usize) -> u8 {
        self.blocks[pos >> self.block_bits][pos & self.block_mask]
    }

    pub fn set_byte(&mut self, pos: usize, b: u8) {
        self.blocks[pos >> self.block_bits][pos & self.block_mask] = b;
    }

    /// Reverses the written bytes in the inclusive range
    /// `[src_pos, dest_pos]` in place.
    pub fn reverse(&mut self, src_pos: usize, dest_pos: usize) {
        debug_assert!(src_pos <= dest_pos);
        debug_assert!(dest_pos < self.get_position());
        let mut left = src_pos;
        let mut right = dest_pos;
        while left < right {
            let b = self.get_byte(left);
            self.set_byte(left, self.get_byte(right));
            self.set_byte(right, b);
            left += 1;
            right -= 1;
        }
    }

    /// Freezes the store: trims the tail block down to the written length.
    /// No writes may follow.
    pub fn finish(&mut self) {
        let last = self.blocks.len() - 1;
        self.blocks[last].truncate(self.upto);
    }

    /// Merges all pages into one contiguous block when the paged slack
    /// exceeds `acceptable_overhead_ratio`, trading one large copy for
    /// locality on every later read.  Positions are unchanged.
    pub fn compact(&mut self, acceptable_overhead_ratio: f32) {
        if self.blocks.len() <= 1 {
            return;
        }
        let len = self.get_position();
        if len == 0 {
            return;
        }
        let allocated: usize = self.blocks.iter().map(|b| b.len()).sum();
        let slack = allocated - len;
        if (slack as f32) / (len as f32) < acceptable_overhead_ratio {
            return;
        }
        let mut merged = Vec::with_capacity(len);
        for block in &self.blocks {
            merged.extend_from_slice(block);
        }
        merged.truncate(len);
        // widen the page geometry so every position still lands in block 0
        let mut bits = self.block_bits;
        while (1usize << bits) < len {
            bits += 1;
        }
        self.block_bits = bits;
        self.block_size = 1 << bits;
        self.block_mask = self.block_size - 1;
        self.upto = len;
        self.blocks = vec![merged];
    }

    pub fn get_forward_reader(&self) -> StoreBytesReader<'_> {
        StoreBytesReader {
            store: self,
            pos: 0,
            reversed: false,
        }
    }

    pub fn get_reverse_reader(&self) -> StoreBytesReader<'_> {
        StoreBytesReader {
            store: self,
            pos: self.get_position() as i64 - 1,
            reversed: true,
        }
    }
}

impl DataOutput for BytesStore {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.push_byte(b);
        Ok(())
    }

    fn write_bytes(&mut self, b: &[u8]) -> Result<()> {
        self.push_bytes(b);
        Ok(())
    }
}

/// Positioned reader over a `BytesStore`.  The reverse flavor walks
/// backwards through the store, which yields reversed node regions in their
/// original write order.
pub struct StoreBytesReader<'a> {
    store: &'a BytesStore,
    pos: i64,
    reversed: bool,
}

impl<'a> StoreBytesReader<'a> {
    pub fn position(&self) -> i64 {
        self.pos
    }

    pub fn set_position(&mut self, pos: i64) {
        self.pos = pos;
    }

    pub fn skip_bytes(&mut self, count: i64) {
        if self.reversed {
            self.pos -= count;
        } else {
            self.pos += count;
        }
    }
}

impl<'a> DataInput for StoreBytesReader<'a> {
    fn read_byte(&mut self) -> Result<u8> {
        if self.pos < 0 || self.pos as usize >= self.store.get_position() {
            bail!(IllegalState(format!(
                "bytes reader position {} out of bounds (store holds {} bytes)",
                self.pos,
                self.store.get_position()
            )));
        }
        let b = self.store.get_byte(self.pos as usize);
        if self.reversed {
            self.pos -= 1;
        } else {
            self.pos += 1;
        }
        Ok(b)
    }
}
