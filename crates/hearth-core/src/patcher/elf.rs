//! ELF `DT_RUNPATH` / `DT_RPATH` records.
//!
//! The strings live in the dynamic string table. A rewritten value may not
//! grow past the original string's terminator because neighbouring strings
//! follow it directly.

use super::{Endian, PatchError, Record, RecordKind, malformed, to_usize};

const ELFMAG: &[u8; 4] = b"\x7fELF";
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: u64 = 0;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

pub(super) fn is_elf(buf: &[u8]) -> bool {
    buf.starts_with(ELFMAG)
}

struct Ident {
    endian: Endian,
    wide: bool,
}

impl Ident {
    fn parse(buf: &[u8]) -> Result<Self, PatchError> {
        let class = *buf.get(EI_CLASS).ok_or_else(|| malformed("truncated ELF ident"))?;
        let data = *buf.get(EI_DATA).ok_or_else(|| malformed("truncated ELF ident"))?;
        let wide = match class {
            ELFCLASS32 => false,
            ELFCLASS64 => true,
            other => return Err(malformed(format!("unknown ELF class {other}"))),
        };
        let endian = match data {
            ELFDATA2LSB => Endian::Little,
            ELFDATA2MSB => Endian::Big,
            other => return Err(malformed(format!("unknown ELF data encoding {other}"))),
        };
        Ok(Self { endian, wide })
    }

    fn word(&self, buf: &[u8], offset: usize) -> Result<u64, PatchError> {
        self.endian.word(buf, offset, self.wide)
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    offset: u64,
    vaddr: u64,
    filesz: u64,
}

impl Segment {
    /// File offset backing virtual address `addr`, if this segment maps it.
    fn file_offset(&self, addr: u64) -> Result<Option<u64>, PatchError> {
        let Some(delta) = addr.checked_sub(self.vaddr).filter(|&d| d < self.filesz) else {
            return Ok(None);
        };
        self.offset
            .checked_add(delta)
            .map(Some)
            .ok_or_else(|| malformed(format!("segment offset {:#x} overflows", self.offset)))
    }
}

fn segments(buf: &[u8], id: &Ident) -> Result<(Vec<Segment>, Option<Segment>), PatchError> {
    let (phoff, phentsize, phnum) = if id.wide {
        (
            id.endian.u64(buf, 0x20)?,
            id.endian.u16(buf, 0x36)?,
            id.endian.u16(buf, 0x38)?,
        )
    } else {
        (
            u64::from(id.endian.u32(buf, 0x1c)?),
            id.endian.u16(buf, 0x2a)?,
            id.endian.u16(buf, 0x2c)?,
        )
    };
    let min_entry = if id.wide { 56 } else { 32 };
    if phnum > 0 && usize::from(phentsize) < min_entry {
        return Err(malformed(format!("program header entry size {phentsize} too small")));
    }

    let mut loads = Vec::new();
    let mut dynamic = None;
    for i in 0..usize::from(phnum) {
        let at = to_usize(phoff)?
            .checked_add(i * usize::from(phentsize))
            .ok_or_else(|| malformed("program header offset overflow"))?;
        let p_type = id.endian.u32(buf, at)?;
        let segment = if id.wide {
            Segment {
                offset: id.endian.u64(buf, at + 8)?,
                vaddr: id.endian.u64(buf, at + 16)?,
                filesz: id.endian.u64(buf, at + 32)?,
            }
        } else {
            Segment {
                offset: u64::from(id.endian.u32(buf, at + 4)?),
                vaddr: u64::from(id.endian.u32(buf, at + 8)?),
                filesz: u64::from(id.endian.u32(buf, at + 16)?),
            }
        };
        match p_type {
            PT_LOAD => loads.push(segment),
            PT_DYNAMIC => dynamic = Some(segment),
            _ => {}
        }
    }
    Ok((loads, dynamic))
}

pub(super) fn search_path_records(buf: &[u8]) -> Result<Vec<Record>, PatchError> {
    let id = Ident::parse(buf)?;
    let (loads, dynamic) = segments(buf, &id)?;
    // Statically linked: no search paths at all.
    let Some(dynamic) = dynamic else {
        return Ok(Vec::new());
    };

    let entry_size = if id.wide { 16 } else { 8 };
    let value_offset = entry_size / 2;
    let start = to_usize(dynamic.offset)?;
    let len = to_usize(dynamic.filesz)?;
    if start.checked_add(len).is_none_or(|end| end > buf.len()) {
        return Err(malformed("dynamic segment extends past end of file"));
    }

    let mut strtab = None;
    let mut strsz = None;
    let mut paths: Vec<u64> = Vec::new();
    for at in (start..start + len).step_by(entry_size) {
        let tag = id.word(buf, at)?;
        let value = id.word(buf, at + value_offset)?;
        match tag {
            DT_NULL => break,
            DT_STRTAB => strtab = Some(value),
            DT_STRSZ => strsz = Some(value),
            DT_RPATH | DT_RUNPATH => paths.push(value),
            _ => {}
        }
    }
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    let strtab = strtab.ok_or_else(|| malformed("DT_RUNPATH without DT_STRTAB"))?;
    let strsz = to_usize(strsz.ok_or_else(|| malformed("DT_RUNPATH without DT_STRSZ"))?)?;
    let table = loads
        .iter()
        .map(|s| s.file_offset(strtab))
        .find_map(Result::transpose)
        .transpose()?
        .ok_or_else(|| malformed(format!("DT_STRTAB address {strtab:#x} is not mapped")))?;
    let table = to_usize(table)?;
    let table_end = table
        .checked_add(strsz)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| malformed("string table extends past end of file"))?;

    paths.sort_unstable();
    paths.dedup();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let offset = table
            .checked_add(to_usize(path)?)
            .filter(|&offset| offset < table_end)
            .ok_or_else(|| malformed(format!("search path offset {path:#x} outside string table")))?;
        let len = buf[offset..table_end]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("search path is not NUL-terminated"))?;
        records.push(Record {
            offset,
            capacity: len + 1,
            kind: RecordKind::List,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{Buf, find};
    use super::super::{PatchOutcome, patch_bytes};
    use super::*;

    const BASE: u64 = 0x40_0000;
    const PLACEHOLDER: &str = "/hearth/placeholder/build";
    const RUNPATH: &str = "/hearth/placeholder/build:$ORIGIN/../lib";

    struct Layout {
        ehdr: usize,
        phent: usize,
        dynent: usize,
    }

    /// A minimal shared object: one `PT_LOAD` covering the whole file, a
    /// `PT_DYNAMIC`, a string table, and a dynamic section.
    fn elf(e: Endian, wide: bool, path_tag: u64, runpath: &str) -> Vec<u8> {
        let l = if wide {
            Layout { ehdr: 64, phent: 56, dynent: 16 }
        } else {
            Layout { ehdr: 52, phent: 32, dynent: 8 }
        };

        let mut dynstr = b"\0libc.so.6\0".to_vec();
        let runpath_index = dynstr.len() as u64;
        dynstr.extend_from_slice(runpath.as_bytes());
        dynstr.push(0);
        dynstr.extend_from_slice(b"libm.so.6\0");

        let strtab_off = l.ehdr + 2 * l.phent;
        let dyn_off = (strtab_off + dynstr.len()).next_multiple_of(8);
        let dyn_len = 5 * l.dynent;
        let total = dyn_off + dyn_len;

        let mut b = Buf::default();
        b.raw(ELFMAG)
            .raw(&[if wide { ELFCLASS64 } else { ELFCLASS32 }])
            .raw(&[if e == Endian::Little { ELFDATA2LSB } else { ELFDATA2MSB }])
            .raw(&[1])
            .pad_to(16);
        b.u16(e, 3).u16(e, 0x3e).u32(e, 1);
        b.word(e, wide, 0).word(e, wide, l.ehdr as u64).word(e, wide, 0);
        b.u32(e, 0)
            .u16(e, u16::try_from(l.ehdr).unwrap())
            .u16(e, u16::try_from(l.phent).unwrap())
            .u16(e, 2)
            .u16(e, 0)
            .u16(e, 0)
            .u16(e, 0);
        assert_eq!(b.bytes.len(), l.ehdr);

        let mut phdr = |p_type: u32, offset: u64, filesz: u64| {
            if wide {
                b.u32(e, p_type).u32(e, 6);
                b.u64(e, offset).u64(e, BASE + offset).u64(e, BASE + offset);
                b.u64(e, filesz).u64(e, filesz).u64(e, 8);
            } else {
                b.u32(e, p_type);
                for v in [offset, BASE + offset, BASE + offset, filesz, filesz] {
                    b.u32(e, u32::try_from(v).unwrap());
                }
                b.u32(e, 6).u32(e, 8);
            }
        };
        phdr(PT_LOAD, 0, total as u64);
        phdr(PT_DYNAMIC, dyn_off as u64, dyn_len as u64);

        b.raw(&dynstr).pad_to(dyn_off);
        for (tag, value) in [
            (1, 1),
            (DT_STRTAB, BASE + strtab_off as u64),
            (DT_STRSZ, dynstr.len() as u64),
            (path_tag, runpath_index),
            (DT_NULL, 0),
        ] {
            b.word(e, wide, tag).word(e, wide, value);
        }
        assert_eq!(b.bytes.len(), total);
        b.bytes
    }

    #[test]
    fn test_patch_all_layouts() {
        for e in [Endian::Little, Endian::Big] {
            for wide in [false, true] {
                let mut buf = elf(e, wide, DT_RUNPATH, RUNPATH);
                let outcome = patch_bytes(&mut buf, PLACEHOLDER, "/opt/metalchat/lib").unwrap();
                assert_eq!(outcome, PatchOutcome::Rewritten { entries: 1 }, "{e:?} wide={wide}");

                let at = find(&buf, b"/opt/metalchat/lib:$ORIGIN/../lib\0").unwrap();
                // Leftover bytes of the old string are zeroed and the next
                // string is intact.
                let old_end = at + RUNPATH.len();
                assert!(buf[at + 33..=old_end].iter().all(|&b| b == 0));
                assert_eq!(&buf[old_end + 1..old_end + 10], b"libm.so.6");
            }
        }
    }

    #[test]
    fn test_rpath_tag() {
        let mut buf = elf(Endian::Little, true, DT_RPATH, RUNPATH);
        assert_eq!(
            patch_bytes(&mut buf, PLACEHOLDER, "/opt/metalchat/lib").unwrap(),
            PatchOutcome::Rewritten { entries: 1 }
        );
    }

    #[test]
    fn test_matching_list_elements_collapse_to_target() {
        let mut buf = elf(
            Endian::Little,
            true,
            DT_RUNPATH,
            "/hearth/placeholder/build/lib:/usr/lib:/hearth/placeholder/build",
        );
        assert_eq!(
            patch_bytes(&mut buf, PLACEHOLDER, "/opt/app").unwrap(),
            PatchOutcome::Rewritten { entries: 2 }
        );
        assert!(find(&buf, b"/opt/app:/usr/lib\0").is_some());
        assert!(find(&buf, b"placeholder").is_none());
    }

    #[test]
    fn test_idempotent() {
        let mut buf = elf(Endian::Big, false, DT_RUNPATH, RUNPATH);
        patch_bytes(&mut buf, PLACEHOLDER, "/opt/metalchat/lib").unwrap();
        let snapshot = buf.clone();
        assert_eq!(
            patch_bytes(&mut buf, PLACEHOLDER, "/opt/metalchat/lib").unwrap(),
            PatchOutcome::AlreadyPatched
        );
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_segment_offset_overflow_is_malformed() {
        let seg = Segment {
            offset: u64::MAX - 4,
            vaddr: BASE,
            filesz: 0x100,
        };
        assert!(matches!(seg.file_offset(BASE + 0x10), Err(PatchError::Malformed(_))));
        assert_eq!(seg.file_offset(BASE + 0x200).unwrap(), None);
        assert_eq!(seg.file_offset(BASE - 1).unwrap(), None);

        let seg = Segment {
            offset: 0x1000,
            vaddr: BASE,
            filesz: 0x100,
        };
        assert_eq!(seg.file_offset(BASE + 0x10).unwrap(), Some(0x1010));
    }

    #[test]
    fn test_cannot_grow_into_next_string() {
        let mut buf = elf(Endian::Little, true, DT_RUNPATH, RUNPATH);
        let original = buf.clone();
        let err = patch_bytes(&mut buf, PLACEHOLDER, "/a/much/longer/install/prefix/lib").unwrap_err();
        assert!(matches!(err, PatchError::CapacityExceeded { .. }));
        assert_eq!(buf, original);
    }

    #[test]
    fn test_entry_not_found() {
        let mut buf = elf(Endian::Little, true, DT_RUNPATH, "$ORIGIN/../lib");
        assert!(matches!(
            patch_bytes(&mut buf, PLACEHOLDER, "/opt"),
            Err(PatchError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_unmapped_string_table() {
        let mut buf = elf(Endian::Little, true, DT_RUNPATH, RUNPATH);
        let strtab_entry = find(&buf, &DT_STRTAB.to_le_bytes()[..8]).unwrap();
        // Point DT_STRTAB far outside the single PT_LOAD.
        buf[strtab_entry + 8..strtab_entry + 16].copy_from_slice(&0xdead_0000u64.to_le_bytes());
        assert!(matches!(
            patch_bytes(&mut buf, PLACEHOLDER, "/opt"),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated() {
        let buf = elf(Endian::Little, true, DT_RUNPATH, RUNPATH);
        for len in [6, 40, 100] {
            let mut truncated = buf[..len].to_vec();
            assert!(
                matches!(
                    patch_bytes(&mut truncated, PLACEHOLDER, "/opt"),
                    Err(PatchError::Malformed(_))
                ),
                "len {len}"
            );
        }
    }

    #[test]
    fn test_unknown_class() {
        let mut buf = elf(Endian::Little, true, DT_RUNPATH, RUNPATH);
        buf[EI_CLASS] = 9;
        assert!(matches!(
            patch_bytes(&mut buf, PLACEHOLDER, "/opt"),
            Err(PatchError::Malformed(_))
        ));
    }
}
