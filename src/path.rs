//! Path resolution: tokenizing segments into staged directory-form
//! names, walking directories segment by segment, glob matching and
//! the drive-prefix syntax.

use core::fmt::Debug;

use crate::codepage::to_upper;
use crate::dir::lfn::MAX_LFN;
use crate::dir::{DirCursor, NSFLAG, NS_BODY, NS_DOT, NS_EXT, NS_LAST, NS_LFN, NS_LOSS, NS_NONAME};
use crate::error::Error;
use crate::io::IO;
use crate::region::dir::{load_cluster, DELETED, KANJI_E5};
use crate::volume::Volume;

/// Characters rejected in any name.
const ILLEGAL_LFN: &str = "*:<>|\"?\x7F";
/// Characters additionally rejected in a short name.
const ILLEGAL_SFN: &str = "+,;=[]";

/// Wildcard-term recursion bound for glob matching.
pub(crate) const FIND_RECURSION: u32 = 4;

fn is_separator(ch: char) -> bool {
    ch == '/' || ch == '\\'
}

/// Split an optional `<digit>:` drive prefix off a path.
pub(crate) fn split_drive(path: &str) -> (Option<u8>, &str) {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(digit), Some(':')) if digit.is_ascii_digit() => {
            (Some(digit as u8 - b'0'), &path[2..])
        }
        _ => (None, path),
    }
}

impl<E: Debug, D: IO<Error = E>> Volume<D> {
    /// Consume one path segment: build the long name into the
    /// working buffer, derive the 8.3 directory form with loss and
    /// case flags, and return the remainder of the path.
    pub(crate) fn create_name<'a>(
        &mut self,
        dp: &mut DirCursor,
        path: &'a str,
    ) -> Result<&'a str, Error<E>> {
        let mut di = 0usize;
        let mut rest_at = path.len();
        let mut last = true;
        let mut iter = path.char_indices();
        loop {
            let (index, ch) = match iter.next() {
                Some(pair) => pair,
                None => break,
            };
            if (ch as u32) < 0x20 {
                rest_at = index;
                break;
            }
            if is_separator(ch) {
                let mut after = index + ch.len_utf8();
                for follower in path[after..].chars() {
                    if !is_separator(follower) {
                        break;
                    }
                    after += follower.len_utf8();
                }
                rest_at = after;
                last = match path[after..].chars().next() {
                    None => true,
                    Some(next) => (next as u32) < 0x20,
                };
                break;
            }
            if (ch as u32) < 0x80 && ILLEGAL_LFN.contains(ch) {
                return Err(Error::InvalidName);
            }
            let mut units = [0u16; 2];
            for &unit in ch.encode_utf16(&mut units).iter() {
                if di >= MAX_LFN {
                    return Err(Error::InvalidName);
                }
                self.lfnbuf[di] = unit;
                di += 1;
            }
        }
        let rest = &path[rest_at..];
        let mut cf = if last { NS_LAST } else { 0 };

        // Dot entries bypass the 8.3 machinery entirely.
        let dots = self.lfnbuf[..di].iter().all(|&wc| wc == '.' as u16);
        if (di == 1 || di == 2) && dots {
            self.lfnbuf[di] = 0;
            for i in 0..11 {
                dp.fname[i] = if i < di { b'.' } else { b' ' };
            }
            dp.fname[NSFLAG] = cf | NS_DOT;
            return Ok(rest);
        }

        while di > 0 {
            let wc = self.lfnbuf[di - 1];
            if wc != ' ' as u16 && wc != '.' as u16 {
                break;
            }
            di -= 1;
        }
        self.lfnbuf[di] = 0;
        if di == 0 {
            return Err(Error::InvalidName);
        }

        // Derive the short name in directory form.
        let mut si = 0usize;
        while self.lfnbuf[si] == ' ' as u16 {
            si += 1;
        }
        if si > 0 || self.lfnbuf[si] == '.' as u16 {
            cf |= NS_LOSS | NS_LFN;
        }
        let mut ext_at = di;
        while ext_at > 0 && self.lfnbuf[ext_at - 1] != '.' as u16 {
            ext_at -= 1;
        }

        dp.fname = [b' '; 12];
        dp.fname[NSFLAG] = 0;
        let mut i = 0usize;
        let mut case_bits = 0u8;
        let mut field_end = 8usize;
        loop {
            let wc = self.lfnbuf[si];
            si += 1;
            if wc == 0 {
                break;
            }
            if wc == ' ' as u16 || (wc == '.' as u16 && si != ext_at) {
                // Embedded spaces and dots drop out of the 8.3 form.
                cf |= NS_LOSS | NS_LFN;
                continue;
            }
            if i >= field_end || si == ext_at {
                if field_end == 11 {
                    cf |= NS_LOSS | NS_LFN;
                    break;
                }
                if si != ext_at {
                    cf |= NS_LOSS | NS_LFN;
                }
                if si > ext_at {
                    break;
                }
                si = ext_at;
                i = 8;
                field_end = 11;
                case_bits <<= 2;
                continue;
            }
            let mut oem = if wc >= 0x80 {
                cf |= NS_LFN;
                match self.codepage.unicode_to_oem(wc) {
                    Some(code) => self.codepage.oem_to_upper(code) as u16,
                    None => 0,
                }
            } else {
                wc
            };
            if oem == 0 || (oem < 0x80 && ILLEGAL_SFN.contains(oem as u8 as char)) {
                oem = '_' as u16;
                cf |= NS_LOSS | NS_LFN;
            } else if (b'A'..=b'Z').contains(&(oem as u8)) {
                case_bits |= 2;
            } else if (b'a'..=b'z').contains(&(oem as u8)) {
                case_bits |= 1;
                oem -= 0x20;
            }
            dp.fname[i] = oem as u8;
            i += 1;
        }
        if dp.fname[0] == DELETED {
            dp.fname[0] = KANJI_E5;
        }
        if field_end == 8 {
            case_bits <<= 2;
        }
        if case_bits & 0x0C == 0x0C || case_bits & 0x03 == 0x03 {
            // Mixed case in one field only survives through an LFN.
            cf |= NS_LFN;
        }
        if cf & NS_LFN == 0 {
            if case_bits & 0x01 != 0 {
                cf |= NS_EXT;
            }
            if case_bits & 0x04 != 0 {
                cf |= NS_BODY;
            }
        }
        dp.fname[NSFLAG] = cf;
        Ok(rest)
    }
}

#[cfg_attr(not(feature = "async"), deasync::deasync)]
impl<E: Debug, D: IO<Error = E>> Volume<D> {
    /// Walk `path` from the root or the current directory. On
    /// success the cursor rests on the found entry, or carries
    /// `NS_NONAME` when the path names a directory origin itself.
    /// `NoFile` leaves the staged last segment ready to register.
    pub(crate) async fn follow_path(
        &mut self,
        dp: &mut DirCursor,
        path: &str,
    ) -> Result<(), Error<E>> {
        let mut rest = match path.chars().next() {
            Some(ch) if is_separator(ch) => {
                dp.sclust = 0;
                path.trim_start_matches(is_separator)
            }
            _ => {
                dp.sclust = self.cdir;
                path
            }
        };
        dp.blk_ofs = None;
        if rest.chars().next().map_or(true, |ch| (ch as u32) < 0x20) {
            // Null path: the origin directory itself.
            dp.fname[NSFLAG] = NS_NONAME;
            return self.dir_sdi(dp, 0).await;
        }
        loop {
            rest = self.create_name(dp, rest)?;
            let found = self.dir_find(dp).await;
            let ns = dp.fname[NSFLAG];
            match found {
                Ok(()) => (),
                Err(Error::NoFile) => {
                    if ns & NS_DOT != 0 {
                        // Dot entry missing only happens at the root:
                        // stay where we are.
                        if ns & NS_LAST == 0 {
                            continue;
                        }
                        dp.fname[NSFLAG] = NS_NONAME;
                        return Ok(());
                    }
                    return match ns & NS_LAST {
                        0 => Err(Error::NoPath),
                        _ => Err(Error::NoFile),
                    };
                }
                Err(e) => return Err(e),
            }
            if ns & NS_LAST != 0 {
                return Ok(());
            }
            if dp.attr & 0x10 == 0 {
                // An intermediate segment resolved to a plain file.
                return Err(Error::NoPath);
            }
            let sect = match dp.sect {
                Some(sect) => sect,
                None => return Err(Error::IntErr),
            };
            self.move_window(sect).await?;
            let offset = dp.entry_offset(self.ssize());
            let entry_cluster = {
                let entry = &self.win()[offset..offset + 32];
                load_cluster(entry, self.fs_type)
            };
            dp.sclust = entry_cluster;
        }
    }
}

fn next_achar(s: &mut &str) -> u32 {
    let mut chars = s.chars();
    match chars.next() {
        Some(ch) => {
            *s = chars.as_str();
            match ch as u32 {
                wc if wc <= 0xFFFF => to_upper(wc as u16) as u32,
                wc => wc,
            }
        }
        None => 0,
    }
}

/// Glob match with `*` and `?`, case folded, bounded to
/// [`FIND_RECURSION`] wildcard terms.
pub(crate) fn pattern_match(pat: &str, name: &str, skip: u32, recursion: u32) -> bool {
    let mut name = name;
    let mut skip = skip;
    while skip & 0xFF != 0 {
        if next_achar(&mut name) == 0 {
            return false;
        }
        skip -= 1;
    }
    if pat.is_empty() && skip != 0 {
        return true;
    }
    loop {
        let mut pp = pat;
        let mut np = name;
        let mismatched = loop {
            let wildcard = pp.chars().next().map_or(false, |c| c == '?' || c == '*');
            if wildcard {
                if recursion == 0 {
                    return false;
                }
                let mut sub_skip = 0u32;
                for ch in pp.clone().chars() {
                    match ch {
                        '?' => sub_skip += 1,
                        '*' => sub_skip |= 0x100,
                        _ => break,
                    }
                    pp = &pp[ch.len_utf8()..];
                }
                if pattern_match(pp, np, sub_skip, recursion - 1) {
                    return true;
                }
                break np.chars().next().map_or(0, |c| c as u32);
            }
            let pchr = next_achar(&mut pp);
            let nchr = next_achar(&mut np);
            if pchr != nchr {
                break nchr;
            }
            if pchr == 0 {
                return true;
            }
        };
        next_achar(&mut name);
        if skip == 0 || mismatched == 0 {
            return false;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::{mkfs, FormatOptions};
    use crate::io::mem::RamDisk;
    use crate::volume::MountOptions;

    fn mounted() -> Volume<RamDisk> {
        let mut disk = RamDisk::new(65536, 512);
        mkfs(&mut disk, &FormatOptions::default()).unwrap();
        Volume::mount(disk, MountOptions::default()).unwrap()
    }

    fn staged_name(volume: &mut Volume<RamDisk>, segment: &str) -> ([u8; 12], u8) {
        let mut dp = DirCursor::new(0);
        let rest = volume.create_name(&mut dp, segment).unwrap();
        assert_eq!(rest, "");
        (dp.fname, dp.fname[NSFLAG])
    }

    #[test]
    fn plain_short_name() {
        let mut volume = mounted();
        let (fname, flags) = staged_name(&mut volume, "README.TXT");
        assert_eq!(&fname[..11], b"README  TXT");
        assert_eq!(flags & (NS_LOSS | NS_LFN), 0);
        assert_ne!(flags & NS_LAST, 0);
    }

    #[test]
    fn lowercase_sets_nt_flags_not_lfn() {
        let mut volume = mounted();
        let (fname, flags) = staged_name(&mut volume, "readme.txt");
        assert_eq!(&fname[..11], b"README  TXT");
        assert_eq!(flags & NS_LFN, 0);
        assert_ne!(flags & NS_BODY, 0);
        assert_ne!(flags & NS_EXT, 0);
    }

    #[test]
    fn mixed_case_needs_lfn() {
        let mut volume = mounted();
        let (_, flags) = staged_name(&mut volume, "ReadMe.txt");
        assert_ne!(flags & NS_LFN, 0);
        assert_eq!(flags & NS_LOSS, 0);
    }

    #[test]
    fn long_name_is_lossy() {
        let mut volume = mounted();
        let (fname, flags) = staged_name(&mut volume, "A long file name.txt");
        assert_ne!(flags & NS_LOSS, 0);
        assert_ne!(flags & NS_LFN, 0);
        // Embedded spaces drop out of the 8.3 body.
        assert_eq!(&fname[..8], b"ALONGFIL");
        assert_eq!(&fname[8..11], b"TXT");
    }

    #[test]
    fn illegal_characters_rejected() {
        let mut volume = mounted();
        let mut dp = DirCursor::new(0);
        for name in ["bad:name", "what?", "pipe|pipe", "quote\"quote"] {
            match volume.create_name(&mut dp, name) {
                Err(Error::InvalidName) => (),
                other => panic!("{} should be invalid, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn sfn_only_illegal_characters_are_replaced() {
        let mut volume = mounted();
        let (fname, flags) = staged_name(&mut volume, "a+b=c.txt");
        assert_ne!(flags & NS_LOSS, 0);
        assert_eq!(&fname[..5], b"A_B_C");
    }

    #[test]
    fn dot_segments() {
        let mut volume = mounted();
        let mut dp = DirCursor::new(0);
        let rest = volume.create_name(&mut dp, "../sub").unwrap();
        assert_eq!(rest, "sub");
        assert_eq!(&dp.fname[..11], b"..         ");
        assert_ne!(dp.fname[NSFLAG] & NS_DOT, 0);
        assert_eq!(dp.fname[NSFLAG] & NS_LAST, 0);
    }

    #[test]
    fn separators_collapse() {
        let mut volume = mounted();
        let mut dp = DirCursor::new(0);
        let rest = volume.create_name(&mut dp, "a//\\b").unwrap();
        assert_eq!(rest, "b");
        assert_eq!(dp.fname[NSFLAG] & NS_LAST, 0);
    }

    #[test]
    fn drive_prefixes() {
        assert_eq!(split_drive("0:/x"), (Some(0), "/x"));
        assert_eq!(split_drive("3:rel"), (Some(3), "rel"));
        assert_eq!(split_drive("/x"), (None, "/x"));
        assert_eq!(split_drive("a:/x"), (None, "a:/x"));
    }

    #[test]
    fn glob_patterns() {
        for (pat, name, expect) in [
            ("*", "anything", true),
            ("*.txt", "NOTES.TXT", true),
            ("*.txt", "notes.md", false),
            ("f?le", "File", true),
            ("f?le", "flle", true),
            ("f?le", "fle", false),
            ("a*b*c", "axxbyyc", true),
            ("a*b*c", "axxbyy", false),
            ("", "", true),
        ] {
            assert_eq!(
                pattern_match(pat, name, 0, FIND_RECURSION),
                expect,
                "pattern {} against {}",
                pat,
                name
            );
        }
    }

    #[test]
    fn follow_empty_path_is_origin() {
        let mut volume = mounted();
        let mut dp = DirCursor::new(0);
        volume.follow_path(&mut dp, "/").unwrap();
        assert_ne!(dp.fname[NSFLAG] & NS_NONAME, 0);
    }

    #[test]
    fn follow_missing_terminal_stages_name() {
        let mut volume = mounted();
        let mut dp = DirCursor::new(0);
        match volume.follow_path(&mut dp, "/missing.txt") {
            Err(Error::NoFile) => (),
            other => panic!("expected NoFile, got {:?}", other),
        }
        assert_eq!(&dp.fname[..11], b"MISSING TXT");
        match volume.follow_path(&mut dp, "/no/such/path.txt") {
            Err(Error::NoPath) => (),
            other => panic!("expected NoPath, got {:?}", other),
        }
    }
}
