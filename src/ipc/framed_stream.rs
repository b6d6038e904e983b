use bincode::{DefaultOptions, Options};
use byteorder::{NativeEndian, WriteBytesExt};
use nix::{
    cmsg_space,
    sys::socket::{self, recvmsg, sendmsg, ControlMessageOwned, SockaddrIn6},
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io::{self, ErrorKind, IoSlice, IoSliceMut, Read, Write},
    os::unix::prelude::{AsRawFd, FromRawFd, RawFd},
};

/// Bincode encoded and length delimited message stream over a unix socket.
///
/// Messages are framed with a 4 byte native endian length prefix. The two
/// writes of `send` either both complete or the operation fails; `recv`
/// distinguishes a clean close by the peer (end of stream on the first byte
/// of the length prefix) from a truncated message, which is unrecoverable.
#[derive(Debug)]
pub struct FramedUnixStream(std::os::unix::net::UnixStream);

impl FramedUnixStream {
    /// Wrap a connected unix stream.
    pub fn new(inner: std::os::unix::net::UnixStream) -> Self {
        Self(inner)
    }

    /// Send a bincode encoded message with a length field.
    pub fn send<M: Serialize>(&mut self, v: M) -> io::Result<()> {
        let data = DefaultOptions::default()
            .serialize(&v)
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        self.0.write_u32::<NativeEndian>(data.len() as u32)?;
        self.0.write_all(&data)
    }

    /// Receive a bincode encoded message with a length field.
    ///
    /// Returns `Ok(None)` if the peer closed the connection before sending a
    /// new message. End of stream anywhere else within a message is an error:
    /// the session cannot be trusted after a partial protocol interaction.
    pub fn recv<M: DeserializeOwned>(&mut self) -> io::Result<Option<M>> {
        let mut prefix = [0u8; 4];
        let read = loop {
            match self.0.read(&mut prefix) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        // A clean close shows up as end of stream on the first prefix byte.
        if read == 0 {
            return Ok(None);
        }

        // A partial prefix must complete. End of stream here means the peer
        // vanished mid message.
        self.0.read_exact(&mut prefix[read..])?;

        let size = u32::from_ne_bytes(prefix) as usize;
        let mut buffer = vec![0u8; size];
        self.0.read_exact(&mut buffer)?;

        DefaultOptions::default()
            .deserialize(&buffer)
            .map(Some)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
    }

    /// Send file descriptors over the unix socket connection.
    ///
    /// The descriptors travel out of band next to a framed message whose
    /// serialized descriptor fields are placeholders. The receiver must call
    /// [`FramedUnixStream::recv_fds`] immediately after reading the message.
    pub fn send_fds<T: AsRawFd>(&self, fds: &[T]) -> io::Result<()> {
        let buf = &[0u8];
        let iov = &[IoSlice::new(buf)];
        let fds = fds.iter().map(AsRawFd::as_raw_fd).collect::<Vec<_>>();
        let control_message = [socket::ControlMessage::ScmRights(&fds)];
        let fd = self.0.as_raw_fd();
        const FLAGS: socket::MsgFlags = socket::MsgFlags::empty();

        sendmsg::<SockaddrIn6>(fd, iov, &control_message, FLAGS, None).map_err(os_err)?;
        Ok(())
    }

    /// Receive `N` file descriptors via the socket.
    pub fn recv_fds<T: FromRawFd, const N: usize>(&self) -> io::Result<Vec<T>> {
        let mut buf = [0u8];
        let iov = &mut [IoSliceMut::new(&mut buf)];
        let mut control_message_buffer = cmsg_space!([RawFd; N]);
        let control_message_buffer = Some(&mut control_message_buffer);
        let fd = self.0.as_raw_fd();
        const FLAGS: socket::MsgFlags = socket::MsgFlags::empty();

        let message =
            recvmsg::<SockaddrIn6>(fd, iov, control_message_buffer, FLAGS).map_err(os_err)?;
        let cmsg = message.cmsgs().map_err(os_err)?.next();
        recv_control_msg::<T, N>(cmsg)
    }

    /// Into UnixStream.
    pub fn into_inner(self) -> std::os::unix::net::UnixStream {
        self.0
    }
}

impl AsRawFd for FramedUnixStream {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[inline]
fn os_err(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn recv_control_msg<T: FromRawFd, const N: usize>(
    message: Option<ControlMessageOwned>,
) -> io::Result<Vec<T>> {
    match message {
        Some(socket::ControlMessageOwned::ScmRights(fds)) => {
            let result: Vec<T> = fds
                .into_iter()
                .map(|fd| unsafe { T::from_raw_fd(fd) })
                .collect();
            if result.len() != N {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected {N} fds, received {}", result.len()),
                ));
            }
            Ok(result)
        }
        Some(message) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("failed to receive fd: unexpected control message: {message:?}"),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::Other,
            "failed to receive fd: missing control message",
        )),
    }
}
