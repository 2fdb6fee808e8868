//! NUMA-local memory and thread placement.
//!
//! Slab chunks are mapped anonymously, bound to a preferred node with
//! `mbind`, and optionally pinned with `mlock`. Worker threads are bound to
//! a node's CPU set read from sysfs. On kernels without NUMA support every
//! operation degrades to its node-oblivious form instead of failing.

use std::io;
use std::ptr::NonNull;

use tracing::warn;

use crate::error::{Error, Result};
use crate::params::PAGE_SIZE;

/// Map a page-aligned anonymous chunk, preferring `node` when given.
///
/// `pinned` additionally locks the chunk into physical memory so it can be
/// used as a DMA target without faulting.
pub fn alloc_chunk(len: usize, node: Option<u32>, pinned: bool) -> Result<NonNull<u8>> {
    debug_assert!(len > 0 && len % PAGE_SIZE == 0);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::ChunkMap {
            len,
            source: io::Error::last_os_error(),
        });
    }
    let ptr = ptr as *mut u8;
    debug_assert_eq!(ptr as usize % PAGE_SIZE, 0);

    if let Some(node) = node {
        prefer_node(ptr, len, node);
    }
    if pinned {
        let ret = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
        if ret != 0 {
            warn!(len, error = %io::Error::last_os_error(), "mlock failed, chunk stays unpinned");
        }
    }

    // SAFETY: mmap returned a non-null mapping (MAP_FAILED was checked above).
    Ok(unsafe { NonNull::new_unchecked(ptr) })
}

/// Unmap a chunk previously returned by [`alloc_chunk`].
///
/// # Safety
///
/// `ptr`/`len` must denote exactly one live chunk from [`alloc_chunk`] and
/// no reference into the chunk may be used afterwards.
pub unsafe fn free_chunk(ptr: NonNull<u8>, len: usize, pinned: bool) {
    if pinned {
        libc::munlock(ptr.as_ptr() as *const libc::c_void, len);
    }
    let ret = libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
    debug_assert_eq!(ret, 0);
}

/// Ask the kernel to place the pages of `[ptr, ptr+len)` on `node`.
///
/// Preferred (not strict) policy: allocation falls back to other nodes when
/// the target is full, matching the behaviour the page cache wants.
#[cfg(target_os = "linux")]
fn prefer_node(ptr: *mut u8, len: usize, node: u32) {
    const MPOL_PREFERRED: libc::c_int = 1;

    let nodemask: libc::c_ulong = 1 << node;
    let maxnode: libc::c_ulong = (8 * std::mem::size_of::<libc::c_ulong>()) as libc::c_ulong;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            len as libc::c_ulong,
            MPOL_PREFERRED,
            &nodemask as *const libc::c_ulong,
            maxnode,
            0 as libc::c_uint,
        )
    };
    if ret != 0 {
        // Non-NUMA kernels report ENOSYS or EINVAL; the mapping stays usable.
        warn!(node, error = %io::Error::last_os_error(), "mbind failed, memory is not node-bound");
    }
}

#[cfg(not(target_os = "linux"))]
fn prefer_node(_ptr: *mut u8, _len: usize, _node: u32) {}

/// Bind the calling thread to the CPUs of `node`.
#[cfg(target_os = "linux")]
pub fn bind_to_node(node: u32) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match node_cpulist(node) {
        Ok(cpus) if !cpus.is_empty() => cpus,
        Ok(_) | Err(_) => {
            warn!(node, "no CPU list for node, thread stays unbound");
            return;
        }
    };
    let mut set = CpuSet::new();
    for cpu in cpus {
        if set.set(cpu).is_err() {
            warn!(node, cpu, "cpu does not fit in affinity set");
        }
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &set) {
        warn!(node, error = %e, "sched_setaffinity failed, thread stays unbound");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn bind_to_node(_node: u32) {}

/// CPUs belonging to a NUMA node, per sysfs.
#[cfg(target_os = "linux")]
fn node_cpulist(node: u32) -> io::Result<Vec<usize>> {
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    let text = std::fs::read_to_string(path)?;
    Ok(parse_cpulist(text.trim()))
}

/// Parse a sysfs cpulist such as `0-3,8,10-11`.
#[allow(dead_code)]
fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse(), hi.trim().parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.trim().parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}
