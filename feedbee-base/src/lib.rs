//! Key material and hashes shared by the feedbee crates.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(feedbee_docsrs, feature(doc_cfg))]

mod hash;
mod key;

pub use self::{
    hash::Hash,
    key::{KeyParsingError, PublicKey, SecretKey, Signature, SignatureError},
};
