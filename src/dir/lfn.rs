//! Long-file-name entry handling: checksum, fragment extraction,
//! comparison and emission, plus numbered 8.3 tail generation.
//!
//! A long name occupies ⌈len/13⌉ entries placed immediately before
//! the short-name entry, last fragment first; the entry holding the
//! highest ordinal carries [`LAST_LONG_ENTRY`].

use crate::codec::{load_u16, store_u16};
use crate::codepage::to_upper;
use crate::region::dir::{
    LAST_LONG_ENTRY, LDIR_ATTR, LDIR_CHARS, LDIR_CHKSUM, LDIR_FST_CLUS_LO, LDIR_ORD, LDIR_TYPE,
};

/// Longest long name in UTF-16 units.
pub(crate) const MAX_LFN: usize = 255;
/// Working buffer: a name plus its terminator.
pub(crate) const LFN_BUF: usize = MAX_LFN + 1;

/// 8-bit rotate-and-add checksum over the 11 short-name bytes,
/// replicated in every LFN entry of the block.
pub(crate) fn checksum(sfn: &[u8]) -> u8 {
    let mut sum = 0u8;
    for &byte in &sfn[..11] {
        sum = (sum >> 1).wrapping_add(sum << 7).wrapping_add(byte);
    }
    sum
}

/// Number of UTF-16 units stored in the working buffer.
pub(crate) fn length(lfnbuf: &[u16; LFN_BUF]) -> usize {
    lfnbuf.iter().position(|&wc| wc == 0).unwrap_or(MAX_LFN)
}

/// Compare one LFN entry against the fragment of the staged name it
/// claims to hold, case-folded.
pub(crate) fn compare(lfnbuf: &[u16; LFN_BUF], entry: &[u8]) -> bool {
    if load_u16(&entry[LDIR_FST_CLUS_LO..]) != 0 {
        return false;
    }
    let ord = (entry[LDIR_ORD] & 0x3F) as usize;
    if ord == 0 {
        return false;
    }
    let mut i = (ord - 1) * 13;
    let mut wc = 1u16;
    for &offset in LDIR_CHARS.iter() {
        let uc = load_u16(&entry[offset..]);
        if wc != 0 {
            if i >= MAX_LFN || to_upper(uc) != to_upper(lfnbuf[i]) {
                return false;
            }
            wc = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    // A matched last fragment must also exhaust the staged name.
    if entry[LDIR_ORD] & LAST_LONG_ENTRY != 0 && wc != 0 && lfnbuf[i] != 0 {
        return false;
    }
    true
}

/// Extract one LFN entry's fragment into the working buffer at the
/// slot its ordinal selects. Returns false on a malformed entry.
pub(crate) fn pick(lfnbuf: &mut [u16; LFN_BUF], entry: &[u8]) -> bool {
    if load_u16(&entry[LDIR_FST_CLUS_LO..]) != 0 {
        return false;
    }
    let ord = (entry[LDIR_ORD] & !LAST_LONG_ENTRY) as usize;
    if ord == 0 || ord > 20 {
        return false;
    }
    let mut i = (ord - 1) * 13;
    let mut wc = 1u16;
    for &offset in LDIR_CHARS.iter() {
        let uc = load_u16(&entry[offset..]);
        if wc != 0 {
            if i >= MAX_LFN {
                return false;
            }
            wc = uc;
            lfnbuf[i] = uc;
            i += 1;
        } else if uc != 0xFFFF {
            return false;
        }
    }
    if entry[LDIR_ORD] & LAST_LONG_ENTRY != 0 && wc != 0 {
        if i >= MAX_LFN {
            return false;
        }
        lfnbuf[i] = 0;
    }
    true
}

/// Fill one LFN entry with fragment `ord` (1-based) of the staged
/// name. The fragment past the terminator is 0xFFFF filler.
pub(crate) fn put(lfnbuf: &[u16; LFN_BUF], entry: &mut [u8], ord: u8, sum: u8) {
    entry[LDIR_CHKSUM] = sum;
    entry[LDIR_ATTR] = 0x0F;
    entry[LDIR_TYPE] = 0;
    store_u16(&mut entry[LDIR_FST_CLUS_LO..], 0);
    let mut i = (ord as usize - 1) * 13;
    let mut wc = 0u16;
    for &offset in LDIR_CHARS.iter() {
        if wc != 0xFFFF {
            wc = lfnbuf[i];
            i += 1;
        }
        store_u16(&mut entry[offset..], wc);
        if wc == 0 {
            wc = 0xFFFF;
        }
    }
    let mut ord = ord;
    if wc == 0xFFFF || lfnbuf[i] == 0 {
        ord |= LAST_LONG_ENTRY;
    }
    entry[LDIR_ORD] = ord;
}

/// Derive a numbered short name `dst` from `src` and sequence `seq`.
/// Sequences above 5 switch to a 16-bit CRC of the long name so
/// heavily colliding directories converge quickly.
pub(crate) fn generate_numbered(dst: &mut [u8; 12], src: &[u8; 12], lfnbuf: &[u16; LFN_BUF], seq: u32) {
    dst[..11].copy_from_slice(&src[..11]);
    let mut seq = seq;
    if seq > 5 {
        let mut sreg = seq;
        for &wc in lfnbuf.iter().take_while(|&&wc| wc != 0) {
            let mut wc = wc;
            for _ in 0..16 {
                sreg = (sreg << 1) + (wc & 1) as u32;
                wc >>= 1;
                if sreg & 0x10000 != 0 {
                    sreg ^= 0x11021;
                }
            }
        }
        seq = sreg & 0xFFFF;
    }
    // Build the "~XXX" suffix in hexadecimal, least digit last.
    let mut suffix = [0u8; 8];
    let mut i = 7;
    loop {
        let digit = (seq % 16) as u8;
        suffix[i] = if digit > 9 { digit - 10 + b'A' } else { digit + b'0' };
        seq /= 16;
        i -= 1;
        if seq == 0 {
            break;
        }
    }
    suffix[i] = b'~';
    // Append the suffix to the name body, clipping the body as needed.
    let mut j = 0;
    while j < i && dst[j] != b' ' {
        j += 1;
    }
    loop {
        dst[j] = if i < 8 {
            let c = suffix[i];
            i += 1;
            c
        } else {
            b' '
        };
        j += 1;
        if j >= 8 {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn staged(name: &str) -> [u16; LFN_BUF] {
        let mut buf = [0u16; LFN_BUF];
        for (i, unit) in name.encode_utf16().enumerate() {
            buf[i] = unit;
        }
        buf
    }

    #[test]
    fn checksum_vector() {
        // Well-known vector: "FILENAMETXT" per the VFAT layout.
        let mut sfn = [0u8; 12];
        sfn[..11].copy_from_slice(b"FILENAMETXT");
        let sum = checksum(&sfn);
        let mut entry = [0u8; 32];
        let buf = staged("filename.txt");
        put(&buf, &mut entry, 1, sum);
        assert_eq!(entry[LDIR_CHKSUM], sum);
        assert_eq!(entry[LDIR_ATTR], 0x0F);
    }

    #[test]
    fn put_and_pick_round_trip() {
        let name = "A rather long file name.txt";
        let buf = staged(name);
        let units = name.encode_utf16().count();
        let entries = (units + 12) / 13;
        let mut picked = [0u16; LFN_BUF];
        for ord in 1..=entries {
            let mut entry = [0u8; 32];
            put(&buf, &mut entry, ord as u8, 0x42);
            if ord == entries {
                assert_ne!(entry[LDIR_ORD] & LAST_LONG_ENTRY, 0);
            }
            assert!(pick(&mut picked, &entry));
            assert!(compare(&buf, &entry));
        }
        assert_eq!(&picked[..units], &buf[..units]);
        assert_eq!(length(&picked), units);
    }

    #[test]
    fn compare_is_case_insensitive() {
        let mut entry = [0u8; 32];
        put(&staged("Mixed Case.TXT"), &mut entry, 1, 0);
        assert!(compare(&staged("mixed case.txt"), &entry));
        assert!(!compare(&staged("mixed cause.txt"), &entry));
    }

    #[test]
    fn numbered_tail_sequences() {
        let mut src = [b' '; 12];
        src[..6].copy_from_slice(b"LONGNA");
        let buf = staged("LongName.txt");
        let mut dst = [0u8; 12];
        generate_numbered(&mut dst, &src, &buf, 1);
        assert_eq!(&dst[..8], b"LONGNA~1");
        generate_numbered(&mut dst, &src, &buf, 5);
        assert_eq!(&dst[..8], b"LONGNA~5");
        // Past 5 the tail becomes a hash, still '~'-prefixed.
        generate_numbered(&mut dst, &src, &buf, 6);
        let tilde = dst[..8].iter().position(|&c| c == b'~').unwrap();
        assert!(tilde < 7);
        assert!(dst[tilde + 1..8].iter().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn numbered_tail_clips_full_body() {
        let mut src = [b' '; 12];
        src[..8].copy_from_slice(b"LONGNAME");
        let buf = staged("LongNameHere.txt");
        let mut dst = [0u8; 12];
        generate_numbered(&mut dst, &src, &buf, 3);
        assert_eq!(&dst[..8], b"LONGNA~3");
    }
}
