//! PE header parsing.
//!
//! Only the headers the inspector consumes are decoded: the DOS stub is
//! validated for its signature and `e_lfanew`, the COFF header for the
//! section count and optional-header size, and the optional header for
//! geometry (entry point, image size, header size, alignments).

use crate::pe::types::*;

/// Little-endian field reads over a byte slice.
pub(crate) trait ReadLe {
    fn u16_at(&self, offset: usize) -> Option<u16>;
    fn u32_at(&self, offset: usize) -> Option<u32>;
    fn u64_at(&self, offset: usize) -> Option<u64>;
    fn bytes_at(&self, offset: usize, len: usize) -> Option<&[u8]>;
}

impl ReadLe for [u8] {
    #[inline]
    fn u16_at(&self, offset: usize) -> Option<u16> {
        self.get(offset..offset + 2)
            .and_then(|b| b.try_into().ok())
            .map(u16::from_le_bytes)
    }

    #[inline]
    fn u32_at(&self, offset: usize) -> Option<u32> {
        self.get(offset..offset + 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
    }

    #[inline]
    fn u64_at(&self, offset: usize) -> Option<u64> {
        self.get(offset..offset + 8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
    }

    #[inline]
    fn bytes_at(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.get(offset..offset.checked_add(len)?)
    }
}

fn truncated(expected: usize, data: &[u8]) -> PeError {
    PeError::Truncated {
        expected,
        actual: data.len(),
    }
}

/// Validate the DOS header and return the NT header offset.
pub fn parse_dos_stub(data: &[u8]) -> Result<usize> {
    if data.len() < 64 {
        return Err(truncated(64, data));
    }
    if data.u16_at(0) != Some(DOS_SIGNATURE) {
        return Err(PeError::InvalidDosSignature);
    }
    let e_lfanew = data.u32_at(60).unwrap_or(0) as usize;
    Ok(e_lfanew)
}

/// Parse the COFF header at `offset`.
pub fn parse_coff_header(data: &[u8], offset: usize) -> Result<CoffHeader> {
    let end = offset.checked_add(20).ok_or_else(|| truncated(usize::MAX, data))?;
    if end > data.len() {
        return Err(truncated(end, data));
    }
    Ok(CoffHeader {
        machine: data.u16_at(offset).unwrap(),
        number_of_sections: data.u16_at(offset + 2).unwrap(),
        time_date_stamp: data.u32_at(offset + 4).unwrap(),
        size_of_optional_header: data.u16_at(offset + 16).unwrap(),
        characteristics: data.u16_at(offset + 18).unwrap(),
    })
}

/// Parse the optional header at `offset`, dispatching on the magic.
pub fn parse_optional_header(data: &[u8], offset: usize, size: u16) -> Result<OptionalHeader> {
    let end = offset
        .checked_add(size as usize)
        .ok_or_else(|| truncated(usize::MAX, data))?;
    if end > data.len() {
        return Err(truncated(end, data));
    }

    let magic = data.u16_at(offset).ok_or_else(|| truncated(offset + 2, data))?;
    let min = match magic {
        PE32_MAGIC => 96,
        PE32PLUS_MAGIC => 112,
        other => return Err(PeError::InvalidMagic(other)),
    };
    if (size as usize) < min {
        return Err(truncated(offset + min, data));
    }

    // Image base sits at +28 as a u32 in PE32 and at +24 as a u64 in
    // PE32+; the geometry fields from +32 on share offsets.
    let image_base = if magic == PE32_MAGIC {
        data.u32_at(offset + 28).unwrap() as u64
    } else {
        data.u64_at(offset + 24).unwrap()
    };

    Ok(OptionalHeader {
        magic,
        address_of_entry_point: data.u32_at(offset + 16).unwrap(),
        image_base,
        section_alignment: data.u32_at(offset + 32).unwrap(),
        file_alignment: data.u32_at(offset + 36).unwrap(),
        size_of_image: data.u32_at(offset + 56).unwrap(),
        size_of_headers: data.u32_at(offset + 60).unwrap(),
        subsystem: data.u16_at(offset + 68).unwrap(),
        dll_characteristics: data.u16_at(offset + 70).unwrap(),
    })
}

/// Parse `count` section headers starting at `offset`.
pub fn parse_section_headers(
    data: &[u8],
    offset: usize,
    count: u16,
) -> Result<Vec<SectionHeader>> {
    let mut sections = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = offset + i * 40;
        let row = data.bytes_at(at, 40).ok_or_else(|| truncated(at + 40, data))?;
        let mut name = [0u8; 8];
        name.copy_from_slice(&row[..8]);
        sections.push(SectionHeader {
            name,
            virtual_size: row.u32_at(8).unwrap(),
            virtual_address: row.u32_at(12).unwrap(),
            size_of_raw_data: row.u32_at(16).unwrap(),
            pointer_to_raw_data: row.u32_at(20).unwrap(),
            characteristics: row.u32_at(36).unwrap(),
        });
    }
    Ok(sections)
}

/// Validate the PE signature and parse COFF, optional header, and the
/// section table in file order.
pub fn parse_nt_headers(
    data: &[u8],
    offset: usize,
) -> Result<(CoffHeader, OptionalHeader, Vec<SectionHeader>)> {
    let sig = data
        .bytes_at(offset, 4)
        .ok_or_else(|| truncated(offset + 4, data))?;
    if sig != PE_SIGNATURE {
        return Err(PeError::InvalidPeSignature);
    }

    let coff = parse_coff_header(data, offset + 4)?;
    let opt_offset = offset + 24;
    let optional = parse_optional_header(data, opt_offset, coff.size_of_optional_header)?;
    let sections = parse_section_headers(
        data,
        opt_offset + coff.size_of_optional_header as usize,
        coff.number_of_sections,
    )?;

    Ok((coff, optional, sections))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_stub_rejects_bad_signature() {
        let mut data = vec![0u8; 64];
        data[0] = b'M';
        data[1] = b'Z';
        data[60] = 0x80;
        assert_eq!(parse_dos_stub(&data).unwrap(), 0x80);

        data[0] = 0xFF;
        assert_eq!(parse_dos_stub(&data), Err(PeError::InvalidDosSignature));

        assert!(matches!(
            parse_dos_stub(&[0u8; 16]),
            Err(PeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_coff_header_fields() {
        let mut data = vec![0u8; 40];
        data[0] = 0x64; // machine 0x8664
        data[1] = 0x86;
        data[2] = 3; // three sections
        data[16] = 0xF0; // optional header size
        let coff = parse_coff_header(&data, 0).unwrap();
        assert_eq!(coff.machine, 0x8664);
        assert_eq!(coff.number_of_sections, 3);
        assert_eq!(coff.size_of_optional_header, 0xF0);
    }

    #[test]
    fn test_optional_header_pe32plus() {
        let mut data = vec![0u8; 112];
        data[0..2].copy_from_slice(&PE32PLUS_MAGIC.to_le_bytes());
        data[16..20].copy_from_slice(&0x1500u32.to_le_bytes()); // entry point
        data[24..32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes()); // image base
        data[56..60].copy_from_slice(&0x6000u32.to_le_bytes()); // size of image
        data[60..64].copy_from_slice(&0x400u32.to_le_bytes()); // size of headers

        let opt = parse_optional_header(&data, 0, 112).unwrap();
        assert!(opt.is_64bit());
        assert_eq!(opt.address_of_entry_point, 0x1500);
        assert_eq!(opt.image_base, 0x1_4000_0000);
        assert_eq!(opt.size_of_image, 0x6000);
        assert_eq!(opt.size_of_headers, 0x400);
    }

    #[test]
    fn test_optional_header_rejects_unknown_magic() {
        let mut data = vec![0u8; 112];
        data[0] = 0x07;
        assert_eq!(
            parse_optional_header(&data, 0, 112),
            Err(PeError::InvalidMagic(0x0007))
        );
    }

    #[test]
    fn test_section_header_row() {
        let mut data = vec![0u8; 80];
        data[0..5].copy_from_slice(b".text");
        data[8..12].copy_from_slice(&0x2000u32.to_le_bytes()); // virtual size
        data[12..16].copy_from_slice(&0x1000u32.to_le_bytes()); // rva
        data[16..20].copy_from_slice(&0x1800u32.to_le_bytes()); // raw size
        data[20..24].copy_from_slice(&0x400u32.to_le_bytes()); // raw ptr
        data[36..40]
            .copy_from_slice(&(IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_EXECUTE).to_le_bytes());

        let sections = parse_section_headers(&data, 0, 1).unwrap();
        assert_eq!(sections[0].name(), ".text");
        assert_eq!(sections[0].virtual_address, 0x1000);
        assert!(sections[0].is_executable());
        assert!(!sections[0].is_writable());
    }
}
