use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::iriswire::config::LISTEN_BACKLOG;
use crate::iriswire::{Error, Result};

pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub fn new(address: String) -> Result<Self> {
        let addr = address.parse()?;
        let sock = TcpSocket::new_v4()?;
        sock.set_reuseaddr(true)?;
        sock.bind(addr)?;
        let listener = sock.listen(LISTEN_BACKLOG)?;
        Ok(Self { address, listener })
    }

    pub fn local_port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or_default()
    }

    pub async fn accept(&self) -> Option<TcpStream> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    #[cfg(unix)]
                    debug!(fd = sock.as_raw_fd(), %remote_addr, server = %self.address.as_str(), "accept connection");
                    #[cfg(not(unix))]
                    debug!(%remote_addr, server = %self.address.as_str(), "accept connection");
                    return Some(sock);
                }
                Err(e) => {
                    if cfg!(unix) && std::env::consts::OS == "linux" {
                        // Return an error only if it's not one of several known recoverable errors.
                        match e.raw_os_error().unwrap_or(0) {
                            libc::ECONNABORTED |
                            libc::EMFILE | // process file-descriptor limit
                            libc::ENFILE | // system wide file-descriptor limit
                            libc::ENOBUFS | // out of memory
                            libc::ENOMEM | // out of memory
                            libc::EPROTO | // protocol error
                            libc::EINTR => {
                                error!(%e, "accept error");
                                continue;
                            },
                            libc::EBADF => return None, // socket closed during shutdown
                            _ => {
                                error!(server = %self.address.as_str(), "unrecoverable accept error: {}", Error::from(e));
                                return None;
                            }
                        }
                    }
                    if e.kind() == io::ErrorKind::ConnectionAborted {
                        continue;
                    }
                    error!(%e, "accept error");
                    return None;
                }
            }
        }
    }
}
