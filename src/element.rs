//! Fixed-width element codec.
//!
//! The payload of every file this crate touches is a raw sequence of
//! unsigned 32-bit integers in the platform's native byte order: no header,
//! no length prefix, no padding. Element order is file offset order.

use std::io;
use std::mem;

use crate::cache::{BlockCache, Fd};

/// Element type of the sorted payload.
pub type Element = u32;

/// On-disk size of a single element.
pub const ELEMENT_BYTES: usize = mem::size_of::<Element>();

/// Decodes a byte buffer into elements. The buffer length must be a
/// multiple of the element size; callers validate lengths before decoding.
pub(crate) fn decode_all(bytes: &[u8]) -> Vec<Element> {
    bytes
        .chunks_exact(ELEMENT_BYTES)
        .map(|raw| Element::from_ne_bytes(raw.try_into().expect("chunk is element sized")))
        .collect()
}

/// Appends the native-endian encoding of `values` to `out`.
pub(crate) fn encode_into(values: &[Element], out: &mut Vec<u8>) {
    for value in values {
        out.extend_from_slice(&value.to_ne_bytes());
    }
}

/// Reads one element at the handle's position, or `None` at end of file.
/// A file ending in the middle of an element is an `UnexpectedEof` error.
pub(crate) fn read_one(cache: &mut BlockCache, fd: Fd) -> io::Result<Option<Element>> {
    let mut raw = [0u8; ELEMENT_BYTES];
    match cache.read(fd, &mut raw)? {
        0 => Ok(None),
        n if n == ELEMENT_BYTES => Ok(Some(Element::from_ne_bytes(raw))),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file ends in the middle of an element",
        )),
    }
}

/// Appends one element at the handle's position.
pub(crate) fn write_one(cache: &mut BlockCache, fd: Fd, value: Element) -> io::Result<()> {
    cache.write(fd, &value.to_ne_bytes()).map(|_| ())
}
