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

//! Construction and sorted traversal of minimal, deterministic, acyclic
//! finite state transducers (FSTs).
//!
//! An FST maps pre-sorted term keys to arbitrary outputs while sharing both
//! prefixes and suffixes between keys, which makes it a compact term
//! dictionary for very large key sets.  `FstBuilder` consumes `(key, output)`
//! pairs in non-decreasing key order and writes the compiled transducer
//! on-the-fly into a byte store; `BytesRefFstEnum` walks a finished FST in
//! lexicographic order and supports exact, ceiling and floor seeks.

#![recursion_limit = "1024"]

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

pub mod core;
pub mod error;
