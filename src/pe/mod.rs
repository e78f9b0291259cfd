//! Portable-executable parsing for image-backed allocations.
//!
//! [`MappedImage`] owns the on-disk bytes of a backing file together with
//! the decoded headers and section table. It answers the questions the
//! entity builder and the suspicion rules ask: where do sections land in
//! RVA space, what protection do their characteristics imply, and what do
//! their bytes look like on disk.

pub mod headers;
pub mod sections;
pub mod types;

pub use sections::SectionTable;
pub use types::{CoffHeader, OptionalHeader, PeError, SectionHeader};

use crate::memory::Subregion;

/// A parsed view over a backing image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage {
    data: Vec<u8>,
    coff: CoffHeader,
    optional: OptionalHeader,
    sections: SectionTable,
}

impl MappedImage {
    /// Parse an image from its on-disk bytes.
    ///
    /// Callers that cannot produce bytes at all have a phantom image, not
    /// a parse failure; this constructor is only reached with a readable
    /// file.
    pub fn from_bytes(data: Vec<u8>) -> types::Result<Self> {
        let nt_offset = headers::parse_dos_stub(&data)?;
        let (coff, optional, section_headers) = headers::parse_nt_headers(&data, nt_offset)?;
        Ok(Self {
            data,
            coff,
            optional,
            sections: SectionTable::new(section_headers),
        })
    }

    pub fn coff(&self) -> &CoffHeader {
        &self.coff
    }

    pub fn optional_header(&self) -> &OptionalHeader {
        &self.optional
    }

    pub fn sections(&self) -> &SectionTable {
        &self.sections
    }

    /// Entry-point RVA; zero for images without one (resource DLLs,
    /// metadata files).
    pub fn entry_point(&self) -> u32 {
        self.optional.address_of_entry_point
    }

    pub fn size_of_image(&self) -> u64 {
        self.optional.size_of_image as u64
    }

    pub fn is_64bit(&self) -> bool {
        self.optional.is_64bit()
    }

    /// The on-disk header bytes, clipped to the declared header size.
    pub fn header_bytes(&self) -> &[u8] {
        let len = (self.optional.size_of_headers as usize).min(self.data.len());
        &self.data[..len]
    }

    /// On-disk bytes of one section, clipped to the file. Shorter than the
    /// virtual size when the tail is zero-fill.
    pub fn section_bytes(&self, section: &SectionHeader) -> &[u8] {
        let start = (section.pointer_to_raw_data as usize).min(self.data.len());
        let end = start
            .saturating_add(section.size_of_raw_data as usize)
            .min(self.data.len());
        &self.data[start..end]
    }

    /// Sections whose virtual extent intersects the subregion, given the
    /// in-memory base of the image.
    pub fn overlapping_sections(&self, image_base: u64, subregion: &Subregion) -> Vec<&SectionHeader> {
        if subregion.base_va() < image_base {
            return Vec::new();
        }
        let rva_start = subregion.base_va() - image_base;
        let rva_end = rva_start.saturating_add(subregion.size());
        if rva_start > u32::MAX as u64 {
            return Vec::new();
        }
        self.sections
            .overlapping(rva_start as u32, rva_end.min(u32::MAX as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::fixture::ImageFileBuilder;
    use crate::pe::types::{IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ};

    #[test]
    fn test_parse_synthetic_image() {
        let bytes = ImageFileBuilder::new()
            .entry_point(0x1100)
            .section(".text", 0x1000, 0x1000, vec![0xC3; 0x200], IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE)
            .section(".rdata", 0x2000, 0x800, vec![0x11; 0x100], IMAGE_SCN_MEM_READ)
            .build();

        let image = MappedImage::from_bytes(bytes).unwrap();
        assert!(image.is_64bit());
        assert_eq!(image.entry_point(), 0x1100);
        assert_eq!(image.sections().sections().len(), 2);
        assert_eq!(image.size_of_image(), 0x3000);
        assert!(image.sections().any_executable());

        let text = image.sections().by_name(".text").unwrap();
        let raw = image.section_bytes(text);
        assert_eq!(raw.len(), 0x200);
        assert!(raw.iter().all(|&b| b == 0xC3));
    }

    #[test]
    fn test_reject_non_pe_bytes() {
        assert_eq!(
            MappedImage::from_bytes(vec![0u8; 16]),
            Err(PeError::Truncated {
                expected: 64,
                actual: 16
            })
        );

        let mut not_mz = vec![0u8; 128];
        not_mz[0] = b'X';
        assert_eq!(
            MappedImage::from_bytes(not_mz),
            Err(PeError::InvalidDosSignature)
        );
    }

    #[test]
    fn test_header_bytes_clipped() {
        let bytes = ImageFileBuilder::new()
            .section(".text", 0x1000, 0x1000, vec![0x90; 0x100], IMAGE_SCN_MEM_EXECUTE)
            .build();
        let image = MappedImage::from_bytes(bytes).unwrap();
        assert_eq!(image.header_bytes().len(), 0x400);
    }
}
