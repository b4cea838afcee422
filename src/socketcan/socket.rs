//! Low level SocketCAN code.

use std::ffi::CString;
use std::os::fd::AsRawFd;

use libc::{
    c_int, c_void, can_filter, can_frame, sa_family_t, sockaddr_can, socklen_t, AF_CAN, CAN_EFF_FLAG,
    CAN_RAW, CAN_RAW_FILTER, CAN_RAW_LOOPBACK, CAN_RAW_RECV_OWN_MSGS, SOL_CAN_RAW,
};

pub struct CanSocket(socket2::Socket);

fn as_bytes<T: Sized>(val: &T) -> &[u8] {
    let sz = std::mem::size_of::<T>();
    unsafe { std::slice::from_raw_parts::<'_, u8>(val as *const _ as *const u8, sz) }
}

fn as_bytes_mut<T: Sized>(val: &mut T) -> &mut [u8] {
    let sz = std::mem::size_of::<T>();
    unsafe { std::slice::from_raw_parts_mut(val as *mut _ as *mut u8, sz) }
}

impl CanSocket {
    pub fn open(ifname: &str) -> std::io::Result<Self> {
        let name = CString::new(ifname)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut addr: sockaddr_can = unsafe { std::mem::zeroed() };
        addr.can_family = AF_CAN as sa_family_t;
        addr.can_ifindex = ifindex as c_int;

        // Convert into sockaddr_storage
        let bytes = as_bytes(&addr);
        let len = bytes.len();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        as_bytes_mut(&mut storage)[..len].copy_from_slice(bytes);
        let sock_addr = unsafe { socket2::SockAddr::new(storage, len as socklen_t) };

        let af_can = socket2::Domain::from(AF_CAN);
        let can_raw = socket2::Protocol::from(CAN_RAW);

        let sock = socket2::Socket::new_raw(af_can, socket2::Type::RAW, Some(can_raw))?;
        sock.bind(&sock_addr)?;
        Ok(Self(sock))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }

    pub fn set_loopback(&self, enabled: bool) -> std::io::Result<()> {
        let loopback = c_int::from(enabled);
        self.set_socket_option(SOL_CAN_RAW, CAN_RAW_LOOPBACK, &loopback)
    }

    pub fn set_recv_own_msgs(&self, enabled: bool) -> std::io::Result<()> {
        let recv_own = c_int::from(enabled);
        self.set_socket_option(SOL_CAN_RAW, CAN_RAW_RECV_OWN_MSGS, &recv_own)
    }

    /// Install kernel-side id/mask filters. Extended ids only, so the EFF flag is set on
    /// both halves of every pair.
    pub fn set_id_filters(&self, pairs: &[(u32, u32)]) -> std::io::Result<()> {
        let filters: Vec<can_filter> = pairs
            .iter()
            .map(|&(id, mask)| {
                let mut f: can_filter = unsafe { std::mem::zeroed() };
                f.can_id = id | CAN_EFF_FLAG;
                f.can_mask = mask | CAN_EFF_FLAG;
                f
            })
            .collect();

        let ret = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                SOL_CAN_RAW,
                CAN_RAW_FILTER,
                filters.as_ptr() as *const c_void,
                std::mem::size_of_val(filters.as_slice()) as socklen_t,
            )
        };
        match ret {
            0 => Ok(()),
            _ => Err(std::io::Error::last_os_error()),
        }
    }

    /// Remove any installed filters, accepting all traffic again.
    pub fn clear_id_filters(&self) -> std::io::Result<()> {
        let all = can_filter_accept_all();
        self.set_socket_option(SOL_CAN_RAW, CAN_RAW_FILTER, &all)
    }

    pub fn write_frame(&self, frame: &can_frame) -> std::io::Result<()> {
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                frame as *const _ as *const c_void,
                std::mem::size_of::<can_frame>(),
            )
        };
        match ret {
            n if n < 0 => Err(std::io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    /// Read one frame. The boolean is true for frames this socket sent itself, which the
    /// kernel flags with MSG_CONFIRM when own-message reception is on.
    pub fn read_frame(&self) -> std::io::Result<(can_frame, bool)> {
        let mut frame: can_frame = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: &mut frame as *mut _ as *mut c_void,
            iov_len: std::mem::size_of::<can_frame>(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let ret = unsafe { libc::recvmsg(self.0.as_raw_fd(), &mut msg, 0) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let loopback = msg.msg_flags & libc::MSG_CONFIRM != 0;
        Ok((frame, loopback))
    }

    fn set_socket_option<T>(&self, level: c_int, name: c_int, val: &T) -> std::io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                level,
                name,
                val as *const _ as *const c_void,
                std::mem::size_of::<T>() as socklen_t,
            )
        };

        match ret {
            0 => Ok(()),
            _ => Err(std::io::Error::last_os_error()),
        }
    }
}

fn can_filter_accept_all() -> can_filter {
    let mut f: can_filter = unsafe { std::mem::zeroed() };
    f.can_id = 0;
    f.can_mask = 0;
    f
}
