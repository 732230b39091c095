//! Typed headroom/tailroom packet buffer.
//!
//! The legacy tunnel client (C5) hands plaintext packets to a library
//! that prepends encryption/auth headers in place. That library panics
//! (or returns a hard error) if the buffer lacks headroom, so the
//! contract is represented as a type rather than a bare `&mut [u8]`:
//! there is no way to construct a `PacketBuffer` without satisfying the
//! headroom/tailroom law, and no way to read `payload()` before the
//! write offset is set correctly.

use crate::error::CoreError;

/// Minimum bytes reserved before the packet payload for in-place header
/// insertion by the legacy library.
pub const MIN_HEADROOM: usize = 256;
/// Minimum bytes reserved after the packet payload for in-place trailer
/// insertion (e.g. an auth tag).
pub const MIN_TAILROOM: usize = 128;

/// `[ HEADROOM | packet bytes | TAILROOM ]`.
///
/// `write_offset` is where the payload starts (>= [`MIN_HEADROOM`]);
/// `tail_capacity` is the space remaining after the payload ends
/// (>= [`MIN_TAILROOM`]).
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
    write_offset: usize,
    payload_len: usize,
}

impl PacketBuffer {
    /// Allocates a buffer sized for `payload` with the default
    /// headroom/tailroom, copies `payload` in, and sets the read pointer
    /// to start at `HEADROOM` as required by the bridge contract.
    pub fn with_payload(payload: &[u8]) -> Self {
        Self::with_headroom_tailroom(payload, MIN_HEADROOM, MIN_TAILROOM)
            .expect("default headroom/tailroom always satisfy the law")
    }

    /// Builds a buffer with caller-specified headroom/tailroom, rejecting
    /// sizes below the required minimums. This is the only constructor
    /// that can fail the headroom law, and it fails loudly rather than
    /// silently clamping: an undersized allocation is a programmer error,
    /// not a runtime condition.
    pub fn with_headroom_tailroom(
        payload: &[u8],
        headroom: usize,
        tailroom: usize,
    ) -> Result<Self, CoreError> {
        if headroom < MIN_HEADROOM || tailroom < MIN_TAILROOM {
            return Err(CoreError::BufferHeadroomExhausted);
        }

        let mut data = vec![0u8; headroom + payload.len() + tailroom];
        data[headroom..headroom + payload.len()].copy_from_slice(payload);

        Ok(Self {
            data,
            write_offset: headroom,
            payload_len: payload.len(),
        })
    }

    /// Bytes available before the payload for in-place header insertion.
    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    /// Bytes available after the payload for in-place trailer insertion.
    pub fn tail_capacity(&self) -> usize {
        self.data.len() - self.write_offset - self.payload_len
    }

    /// The packet payload itself, excluding head/tailroom.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.write_offset..self.write_offset + self.payload_len]
    }

    /// The full backing buffer, handed to the library so it can write
    /// headers into the headroom and a trailer into the tailroom.
    pub fn as_mut_full_buffer(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read-only view of the full `[ HEADROOM | payload | TAILROOM ]`
    /// layout, for handing across the bridge: the library needs the
    /// reserved space itself, not just the payload bytes, to prepend and
    /// append its headers/tags in place.
    pub fn full_buffer(&self) -> &[u8] {
        &self.data
    }

    /// Asserts the headroom law holds. Used by tests and by the legacy
    /// client immediately before a submit crosses into the library.
    pub fn check_headroom_law(&self) -> Result<(), CoreError> {
        if self.write_offset >= MIN_HEADROOM && self.tail_capacity() >= MIN_TAILROOM {
            Ok(())
        } else {
            Err(CoreError::BufferHeadroomExhausted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_buffer_satisfies_headroom_law() {
        let buf = PacketBuffer::with_payload(&[0u8; 64]);
        assert!(buf.write_offset() >= MIN_HEADROOM);
        assert!(buf.tail_capacity() >= MIN_TAILROOM);
        assert!(buf.check_headroom_law().is_ok());
        assert_eq!(buf.payload().len(), 64);
    }

    #[test]
    fn undersized_headroom_is_rejected_at_construction() {
        let err = PacketBuffer::with_headroom_tailroom(&[0u8; 64], 0, MIN_TAILROOM).unwrap_err();
        assert!(matches!(err, CoreError::BufferHeadroomExhausted));
    }

    #[test]
    fn undersized_tailroom_is_rejected_at_construction() {
        let err = PacketBuffer::with_headroom_tailroom(&[0u8; 64], MIN_HEADROOM, 0).unwrap_err();
        assert!(matches!(err, CoreError::BufferHeadroomExhausted));
    }

    #[test]
    fn payload_round_trips() {
        let payload = b"hello headroom";
        let buf = PacketBuffer::with_payload(payload);
        assert_eq!(buf.payload(), payload);
    }
}
