#![allow(clippy::type_complexity)]
#![deny(
    missing_docs,
    clippy::missing_safety_doc,
    unsafe_op_in_unsafe_fn,
    deprecated_in_future,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rustdoc::invalid_codeblock_attributes
)]
#![doc(
    html_playground_url = "https://play.rust-lang.org/",
    test(attr(deny(warnings)))
)]

//! Persistent, concurrent adaptive radix tree
//!
//! The tree lives inside a memory-mapped pool, so that it survives the
//! process. Readers never take locks, writers lock only the nodes they change,
//! and every change is made durable in an order that leaves the tree usable
//! after a crash at any point.
//!
//! # References
//!
//!  - Leis, V., Kemper, A., & Neumann, T. (2013, April). The adaptive radix
//!    tree: ARTful indexing for main-memory databases. In 2013 IEEE 29th
//!    International Conference on Data Engineering (ICDE) (pp. 38-49). IEEE.
//!    [Link to PDF][ART paper]
//!  - Leis, V., Scheibner, F., Kemper, A., & Neumann, T. (2016, June). The ART
//!    of practical synchronization. In Proceedings of the 12th International
//!    Workshop on Data Management on New Hardware (pp. 1-8).
//!
//! [ART paper]: https://www-db.in.tum.de/~leis/papers/ART.pdf

mod config;
mod error;
mod key;
mod nodes;
mod pool;
mod reclaim;
mod tagged_pointer;
mod tree;

pub use config::*;
pub use error::{Error, Result};
pub use key::Key;
pub use nodes::{visitor, *};
pub use pool::PmPool;
pub use tree::*;

#[doc = include_str!("../README.md")]
#[cfg(doctest)]
pub struct ReadmeDoctests;
