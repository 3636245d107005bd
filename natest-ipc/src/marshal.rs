// Copyright 2021-Present natest authors
// SPDX-License-Identifier: Apache-2.0

//! Typed marshalling (§4.D): the depth-first walk that rewrites owned
//! pointers into segment-relative offsets on the way out, and offsets back
//! into owned data on the way in.
//!
//! The original C implementation drove this walk at runtime from a
//! hand-written `uipc_typeinfo` table: an array of `(byte offset, pointee
//! type descriptor)` pairs describing where the pointer fields sat inside an
//! opaque struct. Here the walk is still performed, byte for byte, but the
//! "type descriptor" is the [`SegmentLayout`] trait impl for each concrete
//! payload type (§4.D design note): the Rust compiler -- not a runtime table
//! -- is the single source of truth for which fields are pointers. This is
//! the rewrite explicitly sanctioned in the original design notes ("generate
//! marshallers from the type itself"), scaled down to hand-written impls
//! because the wire format only ever carries five known shapes (§3
//! "Message").

use crate::error::MarshalError;
use crate::segment::{Offset, Segment};

/// Implemented by every payload type that can be written into, and read back
/// out of, a [`Segment`]. An impl's `marshal`/`unmarshal` pair performs
/// exactly the pointer-fixup walk described in §4.D for that type's own
/// pointer fields, recursing into nested [`SegmentLayout`] values (such as
/// the backtrace frame chain nested in `ResultPayload`, see
/// `natest-core`'s `crate::protocol`) the same way the original recursed
/// through nested `uipc_typeinfo` pointers.
pub trait SegmentLayout: Sized {
    /// Bump-allocates space in `seg` for `self`'s own representation,
    /// recursively marshalling any pointee fields first so their offsets
    /// are known, and returns the offset of the resulting record.
    fn marshal(&self, seg: &Segment) -> Result<Offset, MarshalError>;

    /// Reads a value back out of `seg` at `at`, recursively unmarshalling
    /// any pointer fields found valid (< segment size) and leaving the rest
    /// as `None`/opaque per §4.D's edge-case rules.
    fn unmarshal(seg: &Segment, at: Offset) -> Result<Self, MarshalError>;
}

/// Writes an `Option<String>` as a nullable pointer-to-NUL-terminated-string
/// field (§4.D: "a null-string field is handled as a pointer to a
/// null-terminated byte sequence"). Exposed as a free function rather than a
/// blanket `SegmentLayout` impl because, unlike a full payload type, a bare
/// string has no record of its own to return an offset "to" -- callers
/// inline the returned offset directly into a pointer field of their own
/// struct.
pub fn marshal_opt_str(seg: &Segment, value: &Option<String>) -> Result<Offset, MarshalError> {
    match value {
        Some(s) => Ok(seg.alloc_cstr(s)?),
        None => Ok(Offset::NULL),
    }
}

/// Reads back a field written by [`marshal_opt_str`]. An offset `>=` the
/// segment's size (which includes the `NULL` sentinel) decodes to `None`,
/// matching the unmarshal rule in §4.D.
pub fn unmarshal_opt_str(seg: &Segment, offset: Offset) -> Result<Option<String>, MarshalError> {
    if offset.is_null() || offset.0 as usize >= seg.size() {
        return Ok(None);
    }
    Ok(Some(seg.read_cstr(offset)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_segment(size: usize) -> Segment {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .subsec_nanos();
        let path = format!("/natest_marshal_test_{}_{}", std::process::id(), nanos);
        Segment::create(path, size).unwrap()
    }

    #[test]
    fn opt_str_round_trips_present_and_absent() {
        let seg = temp_segment(256);
        let present = marshal_opt_str(&seg, &Some("crash!".to_string())).unwrap();
        assert_eq!(
            unmarshal_opt_str(&seg, present).unwrap(),
            Some("crash!".to_string())
        );

        let absent = marshal_opt_str(&seg, &None).unwrap();
        assert_eq!(unmarshal_opt_str(&seg, absent).unwrap(), None);
        seg.unlink().ok();
    }
}
