//! Executables as the kernel sees them: a list of fixed sections, each a run
//! of virtual pages with initial contents.
//!
//! `ExecutableImage` is stored as
//!
//! ```text
//! "VMEX" | u16 section count | sections...
//! section: u32 first_vpn | u32 num_pages | u8 flags | u32 data_len | data
//! ```
//!
//! all little endian. Flag bit 0 marks the section read-only.

use core::error::Error;
use core::fmt::{self, Display, Formatter};
use nom::bytes::complete::tag;
use nom::combinator::all_consuming;
use nom::multi::{count, length_data};
use nom::number::complete::{le_u16, le_u32, le_u8};
use nom::IResult;
use swapos_shared::mem::MAX_PAGE_NUMBER;

const MAGIC: &[u8; 4] = b"VMEX";
const FLAG_READ_ONLY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    pub first_vpn: usize,
    pub num_pages: usize,
    pub read_only: bool,
}

impl SectionInfo {
    pub fn end_vpn(&self) -> usize {
        self.first_vpn + self.num_pages
    }

    pub fn contains(&self, vpn: usize) -> bool {
        (self.first_vpn..self.end_vpn()).contains(&vpn)
    }
}

/// Supplies the initial contents of a program's fixed sections.
pub trait Executable: Send + Sync {
    fn num_sections(&self) -> usize;

    fn section(&self, index: usize) -> SectionInfo;

    /// Page size the section contents were laid out for.
    fn page_size(&self) -> usize;

    /// Fills `frame` with page `local` (counted from the start of the section)
    /// of section `index`.
    fn load_page(&self, index: usize, local: usize, frame: &mut [u8]);

    /// The section covering `vpn`, if any.
    fn find_section(&self, vpn: usize) -> Option<(usize, SectionInfo)> {
        (0..self.num_sections())
            .map(|index| (index, self.section(index)))
            .find(|(_, info)| info.contains(vpn))
    }

    /// One past the last page used by any section.
    fn end_vpn(&self) -> usize {
        (0..self.num_sections())
            .map(|index| self.section(index).end_vpn())
            .max()
            .unwrap_or(0)
    }
}

pub enum ImageError {
    /// The bytes are not a well-formed image
    Malformed,
    /// Two sections claim the same virtual page
    Overlap { first: usize, second: usize },
    /// A section carries more data than its pages hold
    DataTooLong { section: usize },
    /// A section reaches past the largest page number
    TooLarge { section: usize },
}

impl fmt::Debug for ImageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for ImageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Malformed => write!(f, "malformed executable image"),
            ImageError::Overlap { first, second } => {
                write!(f, "sections {first} and {second} overlap")
            }
            ImageError::DataTooLong { section } => {
                write!(f, "section {section} has more data than pages")
            }
            ImageError::TooLarge { section } => {
                write!(f, "section {section} does not fit the address space")
            }
        }
    }
}

impl Error for ImageError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub info: SectionInfo,
    pub data: Vec<u8>,
}

impl Section {
    pub fn new(first_vpn: usize, num_pages: usize, read_only: bool, data: Vec<u8>) -> Self {
        Self {
            info: SectionInfo {
                first_vpn,
                num_pages,
                read_only,
            },
            data,
        }
    }
}

/// An executable held entirely in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableImage {
    sections: Vec<Section>,
    page_size: usize,
}

fn section(bytes: &[u8]) -> IResult<&[u8], Section> {
    let (bytes, first_vpn) = le_u32(bytes)?;
    let (bytes, num_pages) = le_u32(bytes)?;
    let (bytes, flags) = le_u8(bytes)?;
    let (bytes, data) = length_data(le_u32)(bytes)?;

    Ok((
        bytes,
        Section::new(
            first_vpn as usize,
            num_pages as usize,
            flags & FLAG_READ_ONLY != 0,
            data.to_vec(),
        ),
    ))
}

fn image(bytes: &[u8]) -> IResult<&[u8], Vec<Section>> {
    let (bytes, _) = tag(MAGIC)(bytes)?;
    let (bytes, num_sections) = le_u16(bytes)?;
    count(section, usize::from(num_sections))(bytes)
}

impl ExecutableImage {
    /// Checks that sections fit the address space, do not overlap, and carry
    /// no more data than their pages.
    pub fn new(sections: Vec<Section>, page_size: usize) -> Result<Self, ImageError> {
        for (index, section) in sections.iter().enumerate() {
            let info = section.info;
            if info.first_vpn.saturating_add(info.num_pages) > MAX_PAGE_NUMBER + 1 {
                return Err(ImageError::TooLarge { section: index });
            }
            let capacity = info.num_pages.checked_mul(page_size);
            if capacity.map_or(true, |capacity| section.data.len() > capacity)
                || u32::try_from(section.data.len()).is_err()
            {
                return Err(ImageError::DataTooLong { section: index });
            }
            if let Some(first) = sections[..index].iter().position(|other| {
                other.info.first_vpn < info.end_vpn() && info.first_vpn < other.info.end_vpn()
            }) {
                return Err(ImageError::Overlap {
                    first,
                    second: index,
                });
            }
        }
        if u16::try_from(sections.len()).is_err() {
            return Err(ImageError::Malformed);
        }

        Ok(Self {
            sections,
            page_size,
        })
    }

    pub fn parse(bytes: &[u8], page_size: usize) -> Result<Self, ImageError> {
        let (_, sections) = all_consuming(image)(bytes).map_err(|_| ImageError::Malformed)?;
        Self::new(sections, page_size)
    }

    // Every count and length was range-checked in `new`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&(self.sections.len() as u16).to_le_bytes());
        for section in &self.sections {
            let info = section.info;
            bytes.extend_from_slice(&(info.first_vpn as u32).to_le_bytes());
            bytes.extend_from_slice(&(info.num_pages as u32).to_le_bytes());
            bytes.push(if info.read_only { FLAG_READ_ONLY } else { 0 });
            bytes.extend_from_slice(&(section.data.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&section.data);
        }
        bytes
    }
}

impl Executable for ExecutableImage {
    fn num_sections(&self) -> usize {
        self.sections.len()
    }

    fn section(&self, index: usize) -> SectionInfo {
        self.sections[index].info
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn load_page(&self, index: usize, local: usize, frame: &mut [u8]) {
        let data = &self.sections[index].data;
        let start = (local * frame.len()).min(data.len());
        let end = (start + frame.len()).min(data.len());
        let (loaded, rest) = frame.split_at_mut(end - start);
        loaded.copy_from_slice(&data[start..end]);
        rest.fill(0);
    }
}
