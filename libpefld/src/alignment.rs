use crate::error::Result;
use anyhow::bail;
use std::fmt::Debug;
use std::fmt::Display;

/// An alignment. Always a power of two. PEF stores alignments as the log₂
/// exponent, so that's what we keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub(crate) struct Alignment {
    pub(crate) exponent: u8,
}

/// The smallest alignment we'll give an output section. CodeWarrior used
/// 16-byte section alignment and the Code Fragment Manager expects it.
pub(crate) const SECTION: Alignment = Alignment { exponent: 4 };

/// Alignment of the export hash slot table within the loader section.
pub(crate) const HASH_TABLE: Alignment = Alignment { exponent: 2 };

impl Alignment {
    pub(crate) fn new(raw: u64) -> Result<Self> {
        if !raw.is_power_of_two() {
            bail!("Invalid alignment 0x{raw:x}");
        }
        let exponent = raw.trailing_zeros();
        if exponent > 31 {
            bail!("Unsupported alignment 0x{raw:x}");
        }
        Ok(Alignment {
            exponent: exponent as u8,
        })
    }

    pub(crate) fn from_exponent(exponent: u8) -> Result<Self> {
        if exponent > 31 {
            bail!("Unsupported alignment exponent {exponent}");
        }
        Ok(Alignment { exponent })
    }

    pub(crate) fn value(self) -> u64 {
        1 << self.exponent
    }

    pub(crate) fn align_up(self, value: u64) -> u64 {
        value.next_multiple_of(self.value())
    }

    pub(crate) fn align_up_usize(self, value: usize) -> usize {
        value.next_multiple_of(self.value() as usize)
    }
}

impl Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.value(), f)
    }
}

#[test]
fn test_align_up() {
    assert_eq!(Alignment::new(16).unwrap().align_up(16), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(15), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(1), 16);
    assert_eq!(Alignment::new(16).unwrap().align_up(0), 0);
    assert_eq!(Alignment::new(16).unwrap().align_up(31), 32);
}

#[test]
fn test_new_rejects_non_power_of_two() {
    assert!(Alignment::new(3).is_err());
    assert!(Alignment::new(0).is_err());
    assert_eq!(Alignment::new(4).unwrap().exponent, 2);
}
