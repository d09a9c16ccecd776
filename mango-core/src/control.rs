//! Control socket.
//!
//! An abstract-namespace unix socket the layer listens on. Everything is
//! non-blocking and drained once per present; commands take effect on the
//! next frame, never mid-frame. Wire framing is `:cmd[=value];` ASCII.

use std::io;
use std::os::fd::RawFd;

/// Commands a client can issue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// `capture=1` starts a CSV run, `capture=0` stops it.
    Capture(bool),
    /// `fps_limit=N`; 0 disables the limiter.
    FpsLimit(u32),
}

/// Streaming parser for the `:cmd=value;` framing.
#[derive(Default)]
pub struct ControlParser {
    frame: Option<String>,
}

impl ControlParser {
    /// Feed raw bytes, producing every complete command they contain.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<ControlCommand>) {
        for &byte in bytes {
            match byte {
                b':' => self.frame = Some(String::new()),
                b';' => {
                    if let Some(frame) = self.frame.take() {
                        if let Some(command) = Self::parse_frame(&frame) {
                            out.push(command);
                        }
                    }
                }
                _ => {
                    if let Some(frame) = &mut self.frame {
                        frame.push(byte as char);
                    }
                }
            }
        }
    }

    fn parse_frame(frame: &str) -> Option<ControlCommand> {
        let (cmd, value) = match frame.split_once('=') {
            Some((cmd, value)) => (cmd, value),
            None => (frame, ""),
        };
        match cmd {
            "capture" => Some(ControlCommand::Capture(value == "1")),
            "fps_limit" => value.parse().ok().map(ControlCommand::FpsLimit),
            _ => {
                log::debug!("unknown control command '{cmd}'");
                None
            }
        }
    }
}

#[cfg(unix)]
pub use server::ControlServer;

#[cfg(unix)]
mod server {
    use super::*;

    /// Listener plus at most one connected client.
    pub struct ControlServer {
        listen_fd: RawFd,
        client_fd: Option<RawFd>,
        parser: ControlParser,
        banner: String,
    }

    fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd_flags = libc::fcntl(fd, libc::F_GETFD);
            if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    impl ControlServer {
        /// Bind `\0<name>` in the abstract namespace and start listening.
        pub fn bind_abstract(name: &str, device_name: &str) -> io::Result<Self> {
            let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            set_nonblocking_cloexec(fd)?;

            let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
            addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let name_bytes = name.as_bytes();
            let capacity = addr.sun_path.len() - 1;
            if name_bytes.len() > capacity {
                unsafe { libc::close(fd) };
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "control socket name too long",
                ));
            }
            // Leading NUL selects the abstract namespace.
            for (i, &b) in name_bytes.iter().enumerate() {
                addr.sun_path[i + 1] = b as libc::c_char;
            }
            let addr_len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len())
                as libc::socklen_t;

            let rc = unsafe {
                libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }
            if unsafe { libc::listen(fd, 1) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            log::info!("control socket listening on @{name}");
            Ok(Self {
                listen_fd: fd,
                client_fd: None,
                parser: ControlParser::default(),
                banner: format!(":DeviceName={device_name};:MesaOverlayControlVersion=1;"),
            })
        }

        /// Accept a pending client (if any) and drain it until `EAGAIN`.
        /// Called once per present.
        pub fn poll(&mut self) -> Vec<ControlCommand> {
            let mut commands = Vec::new();

            if self.client_fd.is_none() {
                let fd = unsafe {
                    libc::accept(self.listen_fd, std::ptr::null_mut(), std::ptr::null_mut())
                };
                if fd >= 0 {
                    if set_nonblocking_cloexec(fd).is_ok() {
                        self.send(fd, self.banner.as_bytes());
                        self.client_fd = Some(fd);
                        self.parser = ControlParser::default();
                    } else {
                        unsafe { libc::close(fd) };
                    }
                }
            }

            let Some(fd) = self.client_fd else {
                return commands;
            };

            let mut buf = [0u8; 256];
            loop {
                let n = unsafe {
                    libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                if n > 0 {
                    self.parser.feed(&buf[..n as usize], &mut commands);
                } else if n == 0 {
                    // Orderly disconnect.
                    unsafe { libc::close(fd) };
                    self.client_fd = None;
                    break;
                } else {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::WouldBlock {
                        unsafe { libc::close(fd) };
                        self.client_fd = None;
                    }
                    break;
                }
            }
            commands
        }

        fn send(&self, fd: RawFd, bytes: &[u8]) {
            let _ = unsafe {
                libc::send(
                    fd,
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
        }
    }

    impl Drop for ControlServer {
        fn drop(&mut self) {
            if let Some(fd) = self.client_fd.take() {
                unsafe { libc::close(fd) };
            }
            unsafe { libc::close(self.listen_fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(input: &str) -> Vec<ControlCommand> {
        let mut parser = ControlParser::default();
        let mut out = Vec::new();
        parser.feed(input.as_bytes(), &mut out);
        out
    }

    #[test]
    fn frame_parsing() {
        assert_eq!(feed_all(":capture=1;"), vec![ControlCommand::Capture(true)]);
        assert_eq!(
            feed_all(":capture=0;:fps_limit=144;"),
            vec![
                ControlCommand::Capture(false),
                ControlCommand::FpsLimit(144)
            ]
        );
    }

    #[test]
    fn garbage_between_frames_is_ignored() {
        assert_eq!(
            feed_all("noise:capture=1;more noise"),
            vec![ControlCommand::Capture(true)]
        );
        assert!(feed_all(":unknown=3;").is_empty());
        assert!(feed_all("capture=1;").is_empty(), "no frame start marker");
    }

    #[test]
    fn split_across_reads() {
        let mut parser = ControlParser::default();
        let mut out = Vec::new();
        parser.feed(b":cap", &mut out);
        parser.feed(b"ture=1", &mut out);
        assert!(out.is_empty());
        parser.feed(b";", &mut out);
        assert_eq!(out, vec![ControlCommand::Capture(true)]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn server_accepts_and_drains() {
        use std::io::{Read, Write};
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixStream};

        let name = format!("mangohud-test-{}", std::process::id());
        let mut server = ControlServer::bind_abstract(&name, "Radeon RX 7900").unwrap();
        assert!(server.poll().is_empty());

        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let mut client = UnixStream::connect_addr(&addr).unwrap();
        client.write_all(b":capture=1;").unwrap();
        client.flush().unwrap();

        // Accept happens on one poll; the payload may land on the same or a
        // later poll depending on scheduling.
        let mut commands = Vec::new();
        for _ in 0..50 {
            commands.extend(server.poll());
            if !commands.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(commands, vec![ControlCommand::Capture(true)]);

        // The banner arrived on connect.
        let mut banner = [0u8; 128];
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let n = client.read(&mut banner).unwrap();
        let banner = std::str::from_utf8(&banner[..n]).unwrap();
        assert!(banner.contains(":DeviceName=Radeon RX 7900;"));
        assert!(banner.contains(":MesaOverlayControlVersion=1;"));
    }
}
