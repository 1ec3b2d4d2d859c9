// Copyright (c) 2023-2025 The Mesh Foundation

//! Common infrastructure shared by the mesh Coordinator crates.

#![deny(missing_docs)]
#![warn(unused_extern_crates)]

pub mod logger;
