use std::os::unix::io::RawFd;
use std::{mem, ptr, time};

use io_uring::opcode::{self, AsyncCancel};
use io_uring::squeue::Entry;
use io_uring::types;

use enum_dispatch::enum_dispatch;

use super::net::SockAddr;
use crate::sga::{Segment, Sga};

#[enum_dispatch]
pub trait Task {
    fn entry(&mut self) -> Entry;
}

// Accept a TCP connection.
pub struct Accept {
    pub fd: RawFd,
}

impl Task for Accept {
    fn entry(&mut self) -> Entry {
        opcode::Accept::new(types::Fd(self.fd), ptr::null_mut(), ptr::null_mut())
            .flags(libc::SOCK_CLOEXEC)
            .build()
    }
}

// Cancel an in-flight task, identified by its user data.
pub struct Cancel {
    pub key: u64,
}

impl Task for Cancel {
    fn entry(&mut self) -> Entry {
        AsyncCancel::new(self.key).build()
    }
}

// Dial a TCP connection to the given address.
pub struct Connect {
    pub fd: RawFd,
    addr: Box<SockAddr>,
}

impl Connect {
    pub fn new(fd: RawFd, addr: SockAddr) -> Self {
        Self {
            fd,
            addr: Box::new(addr),
        }
    }
}

impl Task for Connect {
    fn entry(&mut self) -> Entry {
        opcode::Connect::new(types::Fd(self.fd), self.addr.as_ptr(), self.addr.len()).build()
    }
}

// Read from a socket into a pooled segment.
pub struct Read {
    pub fd: RawFd,          // read data from this file descriptor
    pub buffer: Segment,    // buffer that will contain the data
}

impl Task for Read {
    fn entry(&mut self) -> Entry {
        opcode::Recv::new(
            types::Fd(self.fd),
            self.buffer.as_mut_ptr(),
            self.buffer.len() as _,
        )
        .build()
    }
}

// Fires once the duration has passed.
pub struct Timeout {
    duration: Box<types::Timespec>,
}

impl Timeout {
    pub fn new(duration: time::Duration) -> Self {
        let duration = types::Timespec::new()
            .sec(duration.as_secs())
            .nsec(duration.subsec_nanos());

        Self {
            duration: Box::new(duration),
        }
    }
}

impl Task for Timeout {
    fn entry(&mut self) -> Entry {
        opcode::Timeout::new(&*self.duration).build()
    }
}

// Drain the notifier's eventfd; completes whenever somebody rings it.
pub struct Wake {
    pub fd: RawFd,
    counter: Box<[u8; 8]>,
}

impl Wake {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            counter: Box::new([0; 8]),
        }
    }
}

impl Task for Wake {
    fn entry(&mut self) -> Entry {
        opcode::Read::new(types::Fd(self.fd), self.counter.as_mut_ptr(), 8).build()
    }
}

// Send a scatter-gather buffer, starting at `offset` bytes into it.
pub struct Write {
    pub fd: RawFd,
    pub sga: Sga,
    pub offset: usize,
    iovecs: Vec<libc::iovec>,
    header: Box<libc::msghdr>,
}

// The iovecs and header only point into `sga`, which moves along with them.
unsafe impl Send for Write {}

impl Write {
    pub fn new(fd: RawFd, sga: Sga) -> Self {
        Self {
            fd,
            sga,
            offset: 0,
            iovecs: Vec::new(),
            header: Box::new(unsafe { mem::zeroed() }),
        }
    }

    pub fn remaining(&self) -> usize {
        self.sga.len().saturating_sub(self.offset)
    }
}

impl Task for Write {
    fn entry(&mut self) -> Entry {
        self.iovecs.clear();

        let mut skip = self.offset;
        for segment in self.sga.segments() {
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }

            let rest = &segment[skip..];
            skip = 0;

            self.iovecs.push(libc::iovec {
                iov_base: rest.as_ptr() as *mut libc::c_void,
                iov_len: rest.len(),
            });
        }

        self.header.msg_iov = self.iovecs.as_mut_ptr();
        self.header.msg_iovlen = self.iovecs.len() as _;

        opcode::SendMsg::new(types::Fd(self.fd), &*self.header)
            .flags(libc::MSG_NOSIGNAL as u32)
            .build()
    }
}

#[enum_dispatch(Task)]
pub enum TaskType {
    Accept,
    Cancel,
    Connect,
    Read,
    Timeout,
    Wake,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_skips_sent_bytes() {
        let sga = Sga::from_segments(vec![b"GET ".to_vec(), b"/ ".to_vec(), b"HTTP/1.1".to_vec()]);
        let mut write = Write::new(3, sga);

        write.entry();
        assert_eq!(write.iovecs.len(), 3);
        assert_eq!(write.remaining(), 14);

        write.offset = 5;
        write.entry();
        assert_eq!(write.iovecs.len(), 2);
        assert_eq!(write.iovecs[0].iov_len, 1);
        assert_eq!(write.iovecs[1].iov_len, 8);
        assert_eq!(write.header.msg_iovlen as usize, 2);
        assert_eq!(write.remaining(), 9);
    }
}
