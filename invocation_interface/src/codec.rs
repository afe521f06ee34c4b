//! Encoding of call arguments into messages and back.
//!
//! [`args`] handles the extensible argument structures, which are copied
//! verbatim. [`buffers`] handles the sparse buffer descriptor lists, whose
//! addresses have to be translated between the two domains.

pub mod args;
pub mod buffers;

pub use args::{ArgsMut, ArgsRef, ExtensibleArgs};
