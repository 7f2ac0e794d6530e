//! Static PE inspection.
//!
//! Nothing here loads or executes the binary. Version facts come from the
//! version resource; exported getters are evaluated by decoding their
//! machine code, which for the functions we read is always a single
//! `mov eax, imm32; ret` or `lea rax, [rip+disp32]; ret`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use goblin::pe::PE;
use goblin::pe::header::{COFF_MACHINE_X86, COFF_MACHINE_X86_64};
use rhi_schema::{OsPlatform, PackageVersion};

use super::ProbeError;

const FIXED_FILE_INFO_SIGNATURE: [u8; 4] = 0xFEEF_04BD_u32.to_le_bytes();
const MAX_STRING_CHARS: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    raw_pointer: u32,
    raw_size: u32,
}

/// A parsed PE file and its raw bytes.
pub struct PeImage {
    path: PathBuf,
    data: Vec<u8>,
    os: OsPlatform,
    image_base: u64,
    sections: Vec<Section>,
    exports: HashMap<String, u32>,
    imports: Vec<String>,
}

impl std::fmt::Debug for PeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeImage")
            .field("path", &self.path)
            .field("os", &self.os)
            .field("exports", &self.exports.len())
            .field("imports", &self.imports)
            .finish_non_exhaustive()
    }
}

impl PeImage {
    pub fn read(path: &Path) -> Result<Self, ProbeError> {
        let data = std::fs::read(path).map_err(|source| ProbeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let malformed = |message: String| ProbeError::Malformed {
            path: path.to_path_buf(),
            message,
        };

        let (os, image_base, sections, exports, imports) = {
            let pe = PE::parse(&data).map_err(|e| malformed(e.to_string()))?;
            let os = match pe.header.coff_header.machine {
                COFF_MACHINE_X86 => OsPlatform::X86,
                COFF_MACHINE_X86_64 => OsPlatform::X64,
                other => return Err(malformed(format!("unsupported machine 0x{other:04x}"))),
            };
            let sections = pe
                .sections
                .iter()
                .map(|s| Section {
                    virtual_address: s.virtual_address,
                    virtual_size: s.virtual_size,
                    raw_pointer: s.pointer_to_raw_data,
                    raw_size: s.size_of_raw_data,
                })
                .collect();
            let exports = pe
                .exports
                .iter()
                .filter_map(|e| Some((e.name?.to_string(), u32::try_from(e.rva).ok()?)))
                .collect();
            let imports = pe.libraries.iter().map(|l| (*l).to_string()).collect();
            (os, pe.image_base as u64, sections, exports, imports)
        };

        Ok(Self {
            path: path.to_path_buf(),
            data,
            os,
            image_base,
            sections,
            exports,
            imports,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bitness from the COFF machine field.
    pub fn os(&self) -> OsPlatform {
        self.os
    }

    /// Whether the image imports `library`, ignoring case.
    pub fn imports_library(&self, library: &str) -> bool {
        self.imports.iter().any(|l| l.eq_ignore_ascii_case(library))
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.exports.contains_key(name)
    }

    /// Fixed file version from the version resource.
    pub fn file_version(&self) -> Option<PackageVersion> {
        fixed_file_version(&self.data)
    }

    /// A `StringFileInfo` value such as `SpecialBuild` or `ProductName`.
    pub fn version_string(&self, key: &str) -> Option<String> {
        version_string(&self.data, key)
    }

    /// Value returned by an exported `int f(void)`.
    pub fn export_u32(&self, name: &str) -> Option<u32> {
        let code = self.code_at(*self.exports.get(name)?)?;
        decode_mov_eax_ret(code)
    }

    /// Wide string returned by an exported `const wchar_t* f(void)`.
    pub fn export_string(&self, name: &str) -> Option<String> {
        let rva = *self.exports.get(name)?;
        let code = self.code_at(rva)?;
        let target = match self.os {
            OsPlatform::X86 => {
                let va = u64::from(decode_mov_eax_ret(code)?);
                u32::try_from(va.checked_sub(self.image_base)?).ok()?
            }
            OsPlatform::X64 => {
                let disp = decode_lea_rax_ret(code)?;
                rva.checked_add(7)?.checked_add_signed(disp)?
            }
            _ => return None,
        };
        read_utf16z(&self.data, self.rva_to_offset(target)?)
    }

    fn code_at(&self, rva: u32) -> Option<&[u8]> {
        let offset = self.rva_to_offset(rva)?;
        self.data.get(offset..)
    }

    fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        self.sections.iter().find_map(|s| {
            let span = s.virtual_size.max(s.raw_size);
            if rva < s.virtual_address || rva >= s.virtual_address.checked_add(span)? {
                return None;
            }
            let delta = rva - s.virtual_address;
            if delta >= s.raw_size {
                return None;
            }
            usize::try_from(s.raw_pointer.checked_add(delta)?).ok()
        })
    }
}

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// File version from the first `VS_FIXEDFILEINFO` block.
pub(crate) fn fixed_file_version(data: &[u8]) -> Option<PackageVersion> {
    let start = data
        .windows(FIXED_FILE_INFO_SIGNATURE.len())
        .position(|w| w == FIXED_FILE_INFO_SIGNATURE)?;
    let ms = u32_at(data, start + 8)?;
    let ls = u32_at(data, start + 12)?;
    Some(PackageVersion::new(ms >> 16, ms & 0xffff, ls >> 16, ls & 0xffff))
}

/// Value of a `String` entry in the version resource.
///
/// Entries are `wLength, wValueLength, wType, szKey, padding, Value`, with
/// the key and value in UTF-16LE and the value aligned to 32 bits.
pub(crate) fn version_string(data: &[u8], key: &str) -> Option<String> {
    let needle: Vec<u8> = key
        .encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect();
    let key_start = data.windows(needle.len()).position(|w| w == needle)?;
    let value_chars = usize::from(u16_at(data, key_start.checked_sub(4)?)?);
    if value_chars == 0 {
        return None;
    }
    let value_start = (key_start + needle.len()).next_multiple_of(4);
    let units: Vec<u16> = (0..value_chars)
        .map_while(|i| u16_at(data, value_start + i * 2))
        .take_while(|&c| c != 0)
        .collect();
    let value = String::from_utf16(&units).ok()?;
    (!value.is_empty()).then_some(value)
}

/// Null-terminated UTF-16LE string at `offset`.
pub(crate) fn read_utf16z(data: &[u8], offset: usize) -> Option<String> {
    let units: Vec<u16> = (0..MAX_STRING_CHARS)
        .map_while(|i| u16_at(data, offset + i * 2))
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16(&units).ok()
}

/// `B8 imm32 C3`: `mov eax, imm32; ret`.
pub(crate) fn decode_mov_eax_ret(code: &[u8]) -> Option<u32> {
    match code {
        [0xB8, a, b, c, d, 0xC3, ..] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// `48 8D 05 disp32 C3`: `lea rax, [rip+disp32]; ret`.
pub(crate) fn decode_lea_rax_ret(code: &[u8]) -> Option<i32> {
    match code {
        [0x48, 0x8D, 0x05, a, b, c, d, 0xC3, ..] => Some(i32::from_le_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}
