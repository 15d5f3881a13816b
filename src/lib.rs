//! tarn — an IRC server daemon built around a spanning-tree linking protocol.
//!
//! The `link` module is the server-to-server core: independently administered
//! daemons authenticate over framed TCP links, exchange a full-state burst,
//! and from then on route user and channel traffic through a spanning tree
//! that can grow, split, and re-link at any time.

pub mod link;
