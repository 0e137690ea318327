//! Mach-O `LC_RPATH` records.

use super::{Endian, Record, RecordKind, PatchError, malformed, to_usize};

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;
const LC_RPATH: u32 = 0x8000_001c;

/// `struct rpath_command` is cmd, cmdsize, path offset.
const RPATH_COMMAND_SIZE: usize = 12;

/// Java class files share `0xcafebabe`; their version field is never this
/// small.
const MAX_FAT_ARCHES: u32 = 32;

pub(super) fn is_macho(buf: &[u8]) -> bool {
    thin_header(buf).is_some() || fat_header(buf).is_some()
}

/// Byte order and 64-bit flag of a thin Mach-O image.
fn thin_header(buf: &[u8]) -> Option<(Endian, bool)> {
    let magic: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    match (u32::from_le_bytes(magic), u32::from_be_bytes(magic)) {
        (MH_MAGIC, _) => Some((Endian::Little, false)),
        (MH_MAGIC_64, _) => Some((Endian::Little, true)),
        (_, MH_MAGIC) => Some((Endian::Big, false)),
        (_, MH_MAGIC_64) => Some((Endian::Big, true)),
        _ => None,
    }
}

/// Arch count and 64-bit flag of a fat container. Fat headers are always
/// big-endian.
fn fat_header(buf: &[u8]) -> Option<(u32, bool)> {
    let magic = Endian::Big.u32(buf, 0).ok()?;
    let wide = match magic {
        FAT_MAGIC => false,
        FAT_MAGIC_64 => true,
        _ => return None,
    };
    let count = Endian::Big.u32(buf, 4).ok()?;
    (1..=MAX_FAT_ARCHES).contains(&count).then_some((count, wide))
}

pub(super) fn search_path_records(buf: &[u8]) -> Result<Vec<Record>, PatchError> {
    let Some((count, wide)) = fat_header(buf) else {
        return thin_records(buf, 0);
    };

    let entry_size = if wide { 32 } else { 20 };
    let mut records = Vec::new();
    for i in 0..to_usize(u64::from(count))? {
        let entry = 8 + i * entry_size;
        let (offset, size) = if wide {
            (Endian::Big.u64(buf, entry + 8)?, Endian::Big.u64(buf, entry + 16)?)
        } else {
            (
                u64::from(Endian::Big.u32(buf, entry + 8)?),
                u64::from(Endian::Big.u32(buf, entry + 12)?),
            )
        };
        let start = to_usize(offset)?;
        let end = start
            .checked_add(to_usize(size)?)
            .filter(|&end| end <= buf.len())
            .ok_or_else(|| malformed(format!("fat slice {i} extends past end of file")))?;
        records.extend(thin_records(&buf[start..end], start)?);
    }
    Ok(records)
}

/// `LC_RPATH` records of one thin image starting at file offset `base`.
fn thin_records(image: &[u8], base: usize) -> Result<Vec<Record>, PatchError> {
    let (endian, wide) =
        thin_header(image).ok_or_else(|| malformed("fat slice is not a Mach-O image"))?;

    let header_size: usize = if wide { 32 } else { 28 };
    let ncmds = endian.u32(image, 16)?;
    let sizeofcmds = to_usize(u64::from(endian.u32(image, 20)?))?;
    let end = header_size
        .checked_add(sizeofcmds)
        .filter(|&end| end <= image.len())
        .ok_or_else(|| malformed("load commands extend past end of file"))?;

    let mut records = Vec::new();
    let mut cursor = header_size;
    for _ in 0..ncmds {
        let cmd = endian.u32(image, cursor)?;
        let cmdsize = to_usize(u64::from(endian.u32(image, cursor + 4)?))?;
        if cmdsize < 8 || cursor + cmdsize > end {
            return Err(malformed(format!("bad load command size {cmdsize} at {cursor:#x}")));
        }

        if cmd == LC_RPATH {
            let path_offset = to_usize(u64::from(endian.u32(image, cursor + 8)?))?;
            if path_offset < RPATH_COMMAND_SIZE || path_offset >= cmdsize {
                return Err(malformed(format!("bad LC_RPATH path offset at {cursor:#x}")));
            }
            records.push(Record {
                offset: base + cursor + path_offset,
                capacity: cmdsize - path_offset,
                kind: RecordKind::Single,
            });
        }
        cursor += cmdsize;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{Buf, find};
    use super::super::{PatchOutcome, patch_bytes};
    use super::*;

    const LC_LOAD_DYLIB: u32 = 0xc;

    /// A thin image with one dummy load command and one `LC_RPATH` per
    /// `(path, cmdsize)`.
    fn thin(e: Endian, wide: bool, rpaths: &[(&str, u32)]) -> Vec<u8> {
        let mut cmds = Buf::default();
        cmds.u32(e, LC_LOAD_DYLIB).u32(e, 24).u32(e, 24).raw(&[0; 12]);
        for (path, cmdsize) in rpaths {
            let start = cmds.bytes.len();
            cmds.u32(e, LC_RPATH).u32(e, *cmdsize).u32(e, 12).raw(path.as_bytes());
            cmds.pad_to(start + *cmdsize as usize);
        }

        let mut image = Buf::default();
        image
            .u32(e, if wide { MH_MAGIC_64 } else { MH_MAGIC })
            .u32(e, 0x0100_000c)
            .u32(e, 0)
            .u32(e, 2)
            .u32(e, u32::try_from(rpaths.len() + 1).unwrap())
            .u32(e, u32::try_from(cmds.bytes.len()).unwrap())
            .u32(e, 0);
        if wide {
            image.u32(e, 0);
        }
        image.raw(&cmds.bytes).raw(b"__TEXT contents");
        image.bytes
    }

    fn fat(slices: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Buf::default();
        out.u32(Endian::Big, FAT_MAGIC)
            .u32(Endian::Big, u32::try_from(slices.len()).unwrap());
        let mut offset = 256;
        for slice in slices {
            out.u32(Endian::Big, 0x0100_000c)
                .u32(Endian::Big, 0)
                .u32(Endian::Big, offset)
                .u32(Endian::Big, u32::try_from(slice.len()).unwrap())
                .u32(Endian::Big, 4);
            offset += u32::try_from(slice.len()).unwrap().next_multiple_of(256);
        }
        for slice in slices {
            out.pad_to(out.bytes.len().next_multiple_of(256));
            out.raw(slice);
        }
        out.bytes
    }

    #[test]
    fn test_patch_all_layouts() {
        for e in [Endian::Little, Endian::Big] {
            for wide in [false, true] {
                let mut buf = thin(e, wide, &[("@rpath/build", 64)]);
                let outcome = patch_bytes(&mut buf, "@rpath/build", "/install/frameworks").unwrap();
                assert_eq!(outcome, PatchOutcome::Rewritten { entries: 1 }, "{e:?} wide={wide}");

                let at = find(&buf, b"/install/frameworks").unwrap();
                // Rest of the 52-byte slot is NUL padding.
                assert!(buf[at + 19..at + 52].iter().all(|&b| b == 0));
                assert!(find(&buf, b"@rpath/build").is_none());
                assert!(find(&buf, b"__TEXT contents").is_some());
            }
        }
    }

    #[test]
    fn test_second_patch_is_noop() {
        let mut buf = thin(Endian::Little, true, &[("@rpath/build", 64)]);
        patch_bytes(&mut buf, "@rpath/build", "/install/frameworks").unwrap();
        let snapshot = buf.clone();

        let outcome = patch_bytes(&mut buf, "@rpath/build", "/install/frameworks").unwrap();
        assert_eq!(outcome, PatchOutcome::AlreadyPatched);
        assert_eq!(buf, snapshot);
    }

    #[test]
    fn test_unrelated_rpaths_untouched() {
        let mut buf = thin(
            Endian::Little,
            true,
            &[("@executable_path/../lib", 40), ("@rpath/build/Support.framework", 64)],
        );
        let outcome = patch_bytes(&mut buf, "@rpath/build", "/opt/fw").unwrap();
        assert_eq!(outcome, PatchOutcome::Rewritten { entries: 1 });
        assert!(find(&buf, b"@executable_path/../lib\0").is_some());
        assert!(find(&buf, b"/opt/fw\0").is_some());
        assert!(find(&buf, b"Support.framework").is_none());
    }

    #[test]
    fn test_capacity_exceeded_leaves_buffer_unchanged() {
        let mut buf = thin(Endian::Little, true, &[("@rpath/build", 32)]);
        let original = buf.clone();

        let err = patch_bytes(&mut buf, "@rpath/build", "/a/very/long/install/prefix/Frameworks")
            .unwrap_err();
        match err {
            PatchError::CapacityExceeded { needed, capacity, .. } => {
                assert_eq!(capacity, 20);
                assert_eq!(needed, 39);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(buf, original);
    }

    #[test]
    fn test_exact_fit() {
        // 19 bytes + NUL in a 20-byte slot.
        let mut buf = thin(Endian::Little, true, &[("@rpath/build", 32)]);
        assert!(patch_bytes(&mut buf, "@rpath/build", "/install/frameworks").is_ok());
    }

    #[test]
    fn test_entry_not_found() {
        let mut buf = thin(Endian::Big, false, &[("@executable_path/../lib", 40)]);
        assert!(matches!(
            patch_bytes(&mut buf, "@rpath/build", "/x"),
            Err(PatchError::EntryNotFound { .. })
        ));

        let mut none = thin(Endian::Little, true, &[]);
        assert!(matches!(
            patch_bytes(&mut none, "@rpath/build", "/x"),
            Err(PatchError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_truncated_load_commands() {
        let buf = thin(Endian::Little, true, &[("@rpath/build", 64)]);
        let mut truncated = buf[..60].to_vec();
        assert!(matches!(
            patch_bytes(&mut truncated, "@rpath/build", "/x"),
            Err(PatchError::Malformed(_))
        ));

        let mut header_only = buf[..10].to_vec();
        assert!(matches!(
            patch_bytes(&mut header_only, "@rpath/build", "/x"),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_bad_cmdsize() {
        let mut buf = thin(Endian::Little, true, &[("@rpath/build", 64)]);
        // cmdsize of the first load command.
        buf[36..40].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            patch_bytes(&mut buf, "@rpath/build", "/x"),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_fat_patches_every_slice() {
        let mut buf = fat(&[
            thin(Endian::Little, true, &[("@rpath/build", 64)]),
            thin(Endian::Little, false, &[("@rpath/build", 48)]),
        ]);
        let outcome = patch_bytes(&mut buf, "@rpath/build", "/install/frameworks").unwrap();
        assert_eq!(outcome, PatchOutcome::Rewritten { entries: 2 });
        assert!(find(&buf, b"@rpath/build").is_none());

        assert_eq!(
            patch_bytes(&mut buf, "@rpath/build", "/install/frameworks").unwrap(),
            PatchOutcome::AlreadyPatched
        );
    }

    #[test]
    fn test_fat_slice_out_of_bounds() {
        let mut buf = fat(&[thin(Endian::Little, true, &[("@rpath/build", 64)])]);
        buf.truncate(300);
        assert!(matches!(
            patch_bytes(&mut buf, "@rpath/build", "/x"),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_java_class_is_not_fat() {
        let mut class = Buf::default();
        class.u32(Endian::Big, FAT_MAGIC).u16(Endian::Big, 0).u16(Endian::Big, 61);
        assert!(!is_macho(&class.bytes));
    }
}
