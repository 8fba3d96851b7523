use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub(crate) mod active_packetizer;
pub(crate) mod codes;
pub(crate) mod message;
pub(crate) mod packetizer;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod watch;

pub(crate) use self::codes::Code;
pub(crate) use self::message::SaberMessage;
pub(crate) use self::packetizer::{Enqueuer, Packetizer};
pub(crate) use self::request::Request;
pub(crate) use self::response::Response;
pub(crate) use self::watch::Watch;

/// The stream a session engine runs over. Abstracted so tests can drive
/// the engine over something other than a real TCP connection.
pub(crate) trait SaberTransport: AsyncRead + AsyncWrite + Sized + Send + 'static {
    fn connect(addr: SocketAddr) -> Pin<Box<dyn Future<Output = io::Result<Self>> + Send>>;
}

impl SaberTransport for tokio::net::TcpStream {
    fn connect(addr: SocketAddr) -> Pin<Box<dyn Future<Output = io::Result<Self>> + Send>> {
        Box::pin(async move {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}
