//! ELF file writer.
//!
//! Allocates the output image once the layout is fixed, lets every chunk
//! render itself into its disjoint window in parallel, zeroes inter-chunk
//! padding, stamps the optional build-id, and commits the image through a
//! temporary file that a signal handler can unlink.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, Ordering};

use anyhow::{Context, Result};
use md5::Digest as _;
use object::elf;
use rayon::prelude::*;

use crate::chunks::{carve_mut, copy_chunk};
use crate::config::BuildId;
use crate::session::LinkSession;

/// Path bytes for the signal handler; it can only read a pointer.
static TMPFILE: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn signal_handler(_: libc::c_int) {
    cleanup();
    unsafe { libc::_exit(1) };
}

/// Unlinks the in-progress output, if any. Called from the signal handler
/// and from the fatal-error path.
pub fn cleanup() {
    let ptr = TMPFILE.load(Ordering::SeqCst);
    if !ptr.is_null() {
        unsafe { libc::unlink(ptr) };
    }
}

/// Installs SIGINT/SIGTERM handlers that remove the tempfile and exit
/// nonzero.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
    }
}

fn set_tmpfile(path: &Path) {
    let cstr = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).unwrap();
    TMPFILE.store(cstr.into_raw(), Ordering::SeqCst);
}

fn clear_tmpfile() {
    let ptr = TMPFILE.swap(std::ptr::null_mut(), Ordering::SeqCst);
    if !ptr.is_null() {
        drop(unsafe { std::ffi::CString::from_raw(ptr) });
    }
}

/// Copies every chunk into the image. Chunks own disjoint file ranges, so
/// they render in parallel; regular sections parallelize again over their
/// members inside `copy_chunk`.
#[tracing::instrument(skip_all, name = "Copy chunks")]
pub fn copy_chunks(sess: &LinkSession, buf: &mut [u8]) {
    let mut jobs: Vec<(u64, u64, usize)> = sess
        .chunks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.shdr.sh_type != elf::SHT_NOBITS && c.shdr.sh_size != 0)
        .map(|(i, c)| (c.shdr.sh_offset, c.shdr.sh_size, i))
        .collect();
    jobs.sort_by_key(|&(off, _, _)| off);

    let ranges: Vec<(u64, u64)> = jobs.iter().map(|&(off, size, _)| (off, size)).collect();
    let windows = carve_mut(buf, &ranges);
    windows
        .into_par_iter()
        .zip(jobs.par_iter())
        .for_each(|(window, &(_, _, i))| copy_chunk(sess, i, window));
}

/// Zeroes the bytes between chunks so runs are byte-identical regardless
/// of what the buffer held before.
pub fn clear_padding(sess: &LinkSession, buf: &mut [u8]) {
    let mut pos = 0usize;
    for chunk in &sess.chunks {
        let start = chunk.shdr.sh_offset as usize;
        if start > pos {
            buf[pos..start].fill(0);
        }
        let mut end = start;
        if chunk.shdr.sh_type != elf::SHT_NOBITS {
            end += chunk.shdr.sh_size as usize;
        }
        pos = pos.max(end);
    }
    if pos < buf.len() {
        buf[pos..].fill(0);
    }
}

/// Computes the configured digest over the image and writes it into the
/// reserved slot of `.note.gnu.build-id`.
pub fn write_build_id(sess: &LinkSession, buf: &mut [u8]) {
    let Some(i) = sess.index.buildid else { return };
    let style = sess.config.build_id;
    if style == BuildId::None {
        return;
    }
    let desc_off = sess.chunks[i].shdr.sh_offset as usize + 16;
    let size = style.size();

    let digest: Vec<u8> = match style {
        BuildId::None => return,
        BuildId::Uuid => uuid::Uuid::new_v4().as_bytes().to_vec(),
        BuildId::Fast => fast_digest(buf).to_vec(),
        BuildId::Md5 => md5::Md5::digest(&buf[..]).to_vec(),
        BuildId::Sha1 => {
            use sha1::Digest as _;
            sha1::Sha1::digest(&buf[..]).to_vec()
        }
        BuildId::Sha256 => {
            use sha2::Digest as _;
            sha2::Sha256::digest(&buf[..]).to_vec()
        }
    };
    buf[desc_off..desc_off + size].copy_from_slice(&digest[..size]);
}

/// Two-lane FNV-1a over the image; not cryptographic, just cheap and
/// stable.
fn fast_digest(buf: &[u8]) -> [u8; 16] {
    let mut lanes = [0xcbf2_9ce4_8422_2325u64, 0x6c62_272e_07bb_0142u64];
    for (i, &b) in buf.iter().enumerate() {
        let lane = &mut lanes[i & 1];
        *lane ^= u64::from(b);
        *lane = lane.wrapping_mul(0x1000_0000_01b3);
    }
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&lanes[0].to_le_bytes());
    out[8..].copy_from_slice(&lanes[1].to_le_bytes());
    out
}

/// Writes the finished image: through a tempfile next to the output so a
/// failed or interrupted link never leaves a half-written executable, then
/// chmod +x and rename into place.
pub fn commit_output(sess: &LinkSession, buf: &[u8]) -> Result<()> {
    let output = &sess.config.output;
    let tmp: PathBuf = {
        let mut name = output.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        output.with_file_name(name)
    };
    set_tmpfile(&tmp);

    std::fs::write(&tmp, buf).with_context(|| format!("failed to write {}", tmp.display()))?;
    let mut perms = std::fs::metadata(&tmp)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&tmp, perms)?;
    std::fs::rename(&tmp, output)
        .with_context(|| format!("failed to rename into {}", output.display()))?;

    clear_tmpfile();
    Ok(())
}

/// `--print-map`: a simple address map of the output.
pub fn print_map(sess: &LinkSession) {
    println!("{:>16} {:>16} {:>8} {}", "VMA", "OFFSET", "SIZE", "SECTION");
    for chunk in &sess.chunks {
        if chunk.is_header {
            continue;
        }
        println!(
            "{:>16x} {:>16x} {:>8x} {}",
            chunk.shdr.sh_addr,
            chunk.shdr.sh_offset,
            chunk.shdr.sh_size,
            String::from_utf8_lossy(chunk.name)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_digest_is_stable() {
        assert_eq!(fast_digest(b"hello"), fast_digest(b"hello"));
        assert_ne!(fast_digest(b"hello"), fast_digest(b"hellp"));
    }
}
