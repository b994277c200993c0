//
// prog.rs - XDP program attach
//
// Loads a BPF object file, attaches its XDP program to an interface, and
// registers sockets in the program's xsks_map so the kernel can redirect
// traffic per queue. A mode conflict with an already-attached program of
// the opposite mode is resolved by detaching it and retrying once; there
// is no further retry. A program attached here is detached on drop;
// programs attached by someone else are left alone.
//

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;
use std::{io, ptr};

pub const XDP_FLAGS_UPDATE_IF_NOEXIST: u32 = libbpf_sys::XDP_FLAGS_UPDATE_IF_NOEXIST;
pub const XDP_FLAGS_SKB_MODE: u32 = libbpf_sys::XDP_FLAGS_SKB_MODE;
pub const XDP_FLAGS_DRV_MODE: u32 = libbpf_sys::XDP_FLAGS_DRV_MODE;

const MODE_MASK: u32 =
    libbpf_sys::XDP_FLAGS_SKB_MODE | libbpf_sys::XDP_FLAGS_DRV_MODE | libbpf_sys::XDP_FLAGS_HW_MODE;

/// An XDP program this engine loaded and attached.
pub struct XdpProg {
    if_index: u32,
    flags: u32,
    obj: *mut libbpf_sys::bpf_object,
    prog_fd: libc::c_int,
    attached: bool,
}

impl XdpProg {
    /// Opens and loads `path`, picks the program (`program` by name, or the
    /// object's first program) and attaches it to `if_index` with
    /// `xdp_flags`.
    pub fn load_and_attach(
        path: &Path,
        program: Option<&str>,
        if_index: u32,
        xdp_flags: u32,
    ) -> io::Result<Self> {
        let mut prog = XdpProg {
            if_index,
            flags: xdp_flags,
            obj: ptr::null_mut(),
            prog_fd: -1,
            attached: false,
        };

        let path_c = CString::new(path.as_os_str().as_encoded_bytes())?;
        unsafe {
            prog.obj = libbpf_sys::bpf_object__open_file(path_c.as_ptr(), ptr::null());
            if prog.obj.is_null() {
                return Err(io::Error::other(format!(
                    "failed to open BPF object {}: {}",
                    path.display(),
                    io::Error::last_os_error()
                )));
            }
            if libbpf_sys::bpf_object__load(prog.obj) != 0 {
                return Err(io::Error::other(format!(
                    "failed to load BPF object {}",
                    path.display()
                )));
            }

            let bpf_prog = match program {
                Some(name) => {
                    let name_c = CString::new(name)?;
                    let p = libbpf_sys::bpf_object__find_program_by_name(
                        prog.obj,
                        name_c.as_ptr(),
                    );
                    if p.is_null() {
                        return Err(io::Error::other(format!(
                            "no program '{name}' in {}",
                            path.display()
                        )));
                    }
                    p
                }
                None => {
                    let p = libbpf_sys::bpf_object__next_program(prog.obj, ptr::null_mut());
                    if p.is_null() {
                        return Err(io::Error::other(format!(
                            "no programs in {}",
                            path.display()
                        )));
                    }
                    p
                }
            };

            prog.prog_fd = libbpf_sys::bpf_program__fd(bpf_prog);
            if prog.prog_fd < 0 {
                return Err(io::Error::other("failed to get BPF program fd"));
            }
        }

        prog.attach()?;
        log::debug!(
            "attached XDP program from {} to ifindex {} (flags {:#x})",
            path.display(),
            if_index,
            xdp_flags
        );
        Ok(prog)
    }

    fn attach(&mut self) -> io::Result<()> {
        let ifindex = self.if_index as libc::c_int;
        let mut ret =
            unsafe { libbpf_sys::bpf_xdp_attach(ifindex, self.prog_fd, self.flags, ptr::null()) };
        if ret == -libc::EEXIST && self.flags & XDP_FLAGS_UPDATE_IF_NOEXIST == 0 {
            // A program of the opposite mode holds the hook. Detach it and
            // retry with the original flags, once.
            let other_mode = if self.flags & XDP_FLAGS_SKB_MODE != 0 {
                XDP_FLAGS_DRV_MODE
            } else {
                XDP_FLAGS_SKB_MODE
            };
            let swapped = (self.flags & !MODE_MASK) | other_mode;
            ret = unsafe { libbpf_sys::bpf_xdp_detach(ifindex, swapped, ptr::null()) };
            if ret == 0 {
                ret = unsafe {
                    libbpf_sys::bpf_xdp_attach(ifindex, self.prog_fd, self.flags, ptr::null())
                };
            }
        }
        if ret < 0 {
            return Err(io::Error::from_raw_os_error(-ret));
        }
        self.attached = true;
        Ok(())
    }

    /// Registers a socket fd under its queue id in the program's `xsks_map`.
    pub fn register_socket(&self, queue: u32, sock_fd: RawFd) -> io::Result<()> {
        unsafe {
            let map = libbpf_sys::bpf_object__find_map_by_name(self.obj, c"xsks_map".as_ptr());
            if map.is_null() {
                return Err(io::Error::other("BPF object has no xsks_map"));
            }
            let map_fd = libbpf_sys::bpf_map__fd(map);
            if map_fd < 0 {
                return Err(io::Error::other("failed to get xsks_map fd"));
            }
            let ret = libbpf_sys::bpf_map_update_elem(
                map_fd,
                &queue as *const _ as *const libc::c_void,
                &sock_fd as *const _ as *const libc::c_void,
                0,
            );
            if ret < 0 {
                return Err(io::Error::from_raw_os_error(-ret));
            }
        }
        Ok(())
    }
}

impl Drop for XdpProg {
    fn drop(&mut self) {
        if self.attached {
            let ret = unsafe {
                libbpf_sys::bpf_xdp_detach(self.if_index as libc::c_int, self.flags, ptr::null())
            };
            if ret < 0 {
                log::error!(
                    "failed to detach XDP program from ifindex {}: {}",
                    self.if_index,
                    io::Error::from_raw_os_error(-ret)
                );
            }
        }
        if !self.obj.is_null() {
            unsafe { libbpf_sys::bpf_object__close(self.obj) };
        }
    }
}

/// Queries the id of the program currently attached to `if_index`, 0 when
/// none. Used to verify attachment after binding.
pub fn query_prog_id(if_index: u32, xdp_flags: u32) -> io::Result<u32> {
    let mut prog_id: u32 = 0;
    let ret = unsafe {
        libbpf_sys::bpf_xdp_query_id(
            if_index as libc::c_int,
            xdp_flags as libc::c_int,
            &mut prog_id,
        )
    };
    if ret < 0 {
        return Err(io::Error::from_raw_os_error(-ret));
    }
    Ok(prog_id)
}
