//! Code for identifying what sort of file we're dealing with based on the
//! bytes of the file.

use crate::error::LinkError;
use crate::error::Result;
use crate::pef;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    /// A PEF container. Whether it's consumed as an object or as a shared
    /// library depends on how it was named on the command line.
    Pef,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.len() >= 8
            && pef::read_u32(bytes, 0)? == pef::TAG1
            && pef::read_u32(bytes, 4)? == pef::TAG2
        {
            return Ok(FileKind::Pef);
        }
        Err(LinkError::malformed("not a PEF container"))
    }
}

#[test]
fn identifies_pef_magic() {
    let mut bytes = Vec::new();
    pef::write_u32(&mut bytes, pef::TAG1);
    pef::write_u32(&mut bytes, pef::TAG2);
    assert_eq!(FileKind::identify_bytes(&bytes).unwrap(), FileKind::Pef);
    assert!(FileKind::identify_bytes(b"\x7fELF").is_err());
    assert!(FileKind::identify_bytes(b"Jo").is_err());
}
