use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::debug;

use crate::{
    config::ApiConfig,
    transport::{Connection, Dialer},
};

/// Plain TCP dialer. Works on the host and on ESP-IDF's socket layer.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpDialer {
    pub fn new(api: &ApiConfig) -> Self {
        Self {
            host: api.host.clone(),
            port: api.port,
            connect_timeout: Duration::from_millis(api.connect_timeout_ms.max(1)),
            read_timeout: Duration::from_millis(api.read_timeout_ms.max(1)),
        }
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(ErrorKind::NotFound, format!("no address for {}", self.host))
            })
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpConnection;

    fn dial(&mut self) -> io::Result<Self::Conn> {
        let addr = self.resolve()?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        debug!("tcp connected to {addr}");
        Ok(TcpConnection { stream })
    }
}

pub struct TcpConnection {
    stream: TcpStream,
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Connection for TcpConnection {
    fn discard_pending(&mut self) -> io::Result<usize> {
        self.stream.set_nonblocking(true)?;
        let drained = drain(&mut self.stream);
        self.stream.set_nonblocking(false)?;
        drained
    }
}

fn drain(stream: &mut TcpStream) -> io::Result<usize> {
    let mut scratch = [0u8; 64];
    let mut discarded = 0;
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return Err(ErrorKind::ConnectionAborted.into()),
            Ok(count) => discarded += count,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(discarded),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}
