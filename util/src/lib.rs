// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::{fs, io::{self, Write as _}, path::Path};

/// Rounds `value` up to the nearest multiple of `alignment`.
///
/// An `alignment` of 0 is treated as 1.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    let alignment = alignment.max(1);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u32::MAX / alignment * alignment,
    }
}

/// Rounds `value` down to the nearest multiple of `alignment`.
pub fn align_down(value: u32, alignment: u32) -> u32 {
    let alignment = alignment.max(1);

    value / alignment * alignment
}

pub fn is_aligned(value: u32, alignment: u32) -> bool {
    value % alignment.max(1) == 0
}

/// Copies `rows` rows of `row_len` bytes from `src` into `dst`, where consecutive rows are
/// `src_pitch` and `dst_pitch` bytes apart respectively.
///
/// # Panics
///
/// Panics if either slice is too short to hold the rows it is asked to hold.
pub fn copy_rows(
    dst: &mut [u8],
    dst_pitch: usize,
    src: &[u8],
    src_pitch: usize,
    row_len: usize,
    rows: usize,
) {
    if dst_pitch == src_pitch && row_len == src_pitch {
        let len = row_len * rows;
        dst[..len].copy_from_slice(&src[..len]);
        return;
    }

    for row in 0..rows {
        let d = row * dst_pitch;
        let s = row * src_pitch;
        dst[d..(d + row_len)].copy_from_slice(&src[s..(s + row_len)]);
    }
}

/// Writes `parts` back-to-back into the file at `path`, replacing any previous contents.
///
/// This is best-effort: failure to create or write the file is logged and otherwise ignored.
pub fn dump_text(path: &Path, parts: &[&str]) {
    let result = fs::File::create(path).and_then(|mut file| {
        for part in parts {
            file.write_all(part.as_bytes())?;
        }

        file.flush()
    });

    if let Err(e) = result {
        log_dump_failure(path, &e);
    }
}

fn log_dump_failure(path: &Path, e: &io::Error) {
    tracing::debug!("Failed to write {}: {}", path.display(), e);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_up(u32::MAX, 16), u32::MAX / 16 * 16);
    }

    #[test]
    fn align_down_truncates() {
        assert_eq!(align_down(0, 4), 0);
        assert_eq!(align_down(7, 4), 4);
        assert_eq!(align_down(8, 4), 8);
        assert!(is_aligned(256, 256));
        assert!(!is_aligned(257, 256));
    }

    #[test]
    fn copy_rows_repitches() {
        // Two rows of three bytes, tightly packed in the source, padded to four in the
        // destination.
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 8];
        copy_rows(&mut dst, 4, &src, 3, 3, 2);
        assert_eq!(dst, [1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn copy_rows_contiguous() {
        let src = [9u8; 12];
        let mut dst = [0u8; 12];
        copy_rows(&mut dst, 4, &src, 4, 4, 3);
        assert_eq!(dst, src);
    }

    #[test]
    fn dump_text_to_missing_dir_is_silent() {
        dump_text(Path::new("/nonexistent/dir/for/sure/shader_0.txt"), &["x"]);
    }
}
