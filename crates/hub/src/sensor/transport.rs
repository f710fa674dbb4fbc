//! Byte transports to the sensor source: a TCP bridge, or the Pi UART when
//! built with the `gpio` feature.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BAUD: u32 = 9600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorAddress {
    /// `host:port` of a serial-to-network bridge or the node emulator.
    Tcp(String),
    /// Local serial device, e.g. `/dev/ttyUSB0@9600`.
    Serial { path: String, baud: u32 },
}

impl FromStr for SensorAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unsupported = || TransportError::Unsupported(s.to_string());

        if s.starts_with('/') {
            return match s.split_once('@') {
                Some((path, baud)) => Ok(Self::Serial {
                    path: path.to_string(),
                    baud: baud.parse().map_err(|_| unsupported())?,
                }),
                None => Ok(Self::Serial {
                    path: s.to_string(),
                    baud: DEFAULT_BAUD,
                }),
            };
        }

        let hostport = s.strip_prefix("tcp://").unwrap_or(s);
        match hostport.rsplit_once(':') {
            Some((host, port))
                if !host.is_empty()
                    && !host.contains(char::is_whitespace)
                    && port.parse::<u16>().is_ok() =>
            {
                Ok(Self::Tcp(hostport.to_string()))
            }
            _ => Err(unsupported()),
        }
    }
}

impl fmt::Display for SensorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(hostport) => write!(f, "tcp://{hostport}"),
            Self::Serial { path, baud } => write!(f, "{path}@{baud}"),
        }
    }
}

/// An open link. Dropping it closes the connection.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(feature = "gpio")]
    Uart(uart::UartReader),
}

impl Transport {
    pub async fn open(address: &SensorAddress) -> Result<Self, TransportError> {
        match address {
            SensorAddress::Tcp(hostport) => {
                let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(hostport)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(source)) => {
                        return Err(TransportError::Open {
                            address: address.to_string(),
                            source,
                        })
                    }
                    Err(_) => {
                        return Err(TransportError::Open {
                            address: address.to_string(),
                            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                        })
                    }
                };
                // frames are tiny; don't let Nagle batch them
                stream.set_nodelay(true).ok();
                Ok(Self::Tcp(stream))
            }
            #[cfg(feature = "gpio")]
            SensorAddress::Serial { path, baud } => uart::UartReader::open(path, *baud)
                .map(Self::Uart)
                .map_err(|source| TransportError::Open {
                    address: address.to_string(),
                    source,
                }),
            #[cfg(not(feature = "gpio"))]
            SensorAddress::Serial { .. } => Err(TransportError::Unsupported(format!(
                "{address} (built without the gpio feature)"
            ))),
        }
    }

    /// Next chunk of bytes. Silence longer than `idle` is an error so a dead
    /// peer is noticed without a keepalive.
    pub async fn read_chunk(&mut self, idle: Duration) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::Tcp(stream) => {
                let mut buf = [0u8; 128];
                let n = timeout(idle, stream.read(&mut buf))
                    .await
                    .map_err(|_| TransportError::Idle(idle.as_secs()))??;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                Ok(buf[..n].to_vec())
            }
            #[cfg(feature = "gpio")]
            Self::Uart(reader) => timeout(idle, reader.recv())
                .await
                .map_err(|_| TransportError::Idle(idle.as_secs()))?,
        }
    }
}

#[cfg(feature = "gpio")]
mod uart {
    use rppal::uart::{Parity, Uart};
    use std::io;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tracing::debug;

    use crate::error::TransportError;

    /// rppal's UART is blocking; a reader thread forwards chunks to the
    /// async side until the receiver is dropped.
    pub struct UartReader {
        rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    }

    impl UartReader {
        pub fn open(path: &str, baud: u32) -> io::Result<Self> {
            let mut port = Uart::with_path(path, baud, Parity::None, 8, 1).map_err(io::Error::other)?;
            port.set_read_mode(0, Duration::from_secs(1))
                .map_err(io::Error::other)?;

            let (tx, rx) = mpsc::channel(16);
            let path = path.to_string();
            std::thread::spawn(move || {
                let mut buf = [0u8; 128];
                while !tx.is_closed() {
                    let chunk = match port.read(&mut buf) {
                        Ok(0) => continue,
                        Ok(n) => Ok(buf[..n].to_vec()),
                        Err(e) => Err(io::Error::other(e)),
                    };
                    let failed = chunk.is_err();
                    if tx.blocking_send(chunk).is_err() || failed {
                        break;
                    }
                }
                debug!(path = %path, "uart reader thread exiting");
            });
            Ok(Self { rx })
        }

        pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
            match self.rx.recv().await {
                Some(Ok(chunk)) => Ok(chunk),
                Some(Err(e)) => Err(TransportError::Read(e)),
                None => Err(TransportError::Closed),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    // -- Address parsing --------------------------------------------------

    #[test]
    fn parses_tcp_forms() {
        assert_eq!(
            "tcp://10.0.0.5:1444".parse::<SensorAddress>().unwrap(),
            SensorAddress::Tcp("10.0.0.5:1444".into())
        );
        assert_eq!(
            "bridge.local:1444".parse::<SensorAddress>().unwrap(),
            SensorAddress::Tcp("bridge.local:1444".into())
        );
    }

    #[test]
    fn parses_serial_forms() {
        assert_eq!(
            "/dev/ttyUSB0".parse::<SensorAddress>().unwrap(),
            SensorAddress::Serial {
                path: "/dev/ttyUSB0".into(),
                baud: 9600
            }
        );
        assert_eq!(
            "/dev/serial0@115200".parse::<SensorAddress>().unwrap(),
            SensorAddress::Serial {
                path: "/dev/serial0".into(),
                baud: 115200
            }
        );
    }

    #[test]
    fn rejects_unparseable_addresses() {
        for bad in ["", "COM3", "host:notaport", ":1444", "/dev/ttyUSB0@fast", "a b:1"] {
            let err = bad.parse::<SensorAddress>().unwrap_err();
            assert!(
                matches!(err, TransportError::Unsupported(_)),
                "{bad:?} gave {err}"
            );
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        let addr = SensorAddress::Tcp("127.0.0.1:9".into());
        assert_eq!(addr.to_string().parse::<SensorAddress>().unwrap(), addr);
    }

    // -- TCP link ---------------------------------------------------------

    #[tokio::test]
    async fn tcp_reads_bytes_then_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = SensorAddress::Tcp(listener.local_addr().unwrap().to_string());

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"<1,2,3,4|10>").await.unwrap();
        });

        let mut transport = Transport::open(&addr).await.unwrap();
        let mut got = Vec::new();
        loop {
            match transport.read_chunk(Duration::from_secs(5)).await {
                Ok(chunk) => got.extend(chunk),
                Err(TransportError::Closed) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        server.await.unwrap();
        assert_eq!(got, b"<1,2,3,4|10>");
    }

    #[tokio::test]
    async fn silent_peer_is_idle_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = SensorAddress::Tcp(listener.local_addr().unwrap().to_string());
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(sock);
        });

        let mut transport = Transport::open(&addr).await.unwrap();
        let err = transport
            .read_chunk(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Idle(_)));
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_open_error() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let addr = SensorAddress::Tcp(format!("127.0.0.1:{port}"));
        let err = Transport::open(&addr).await.err().unwrap();
        assert!(matches!(err, TransportError::Open { .. }));
    }

    #[cfg(not(feature = "gpio"))]
    #[tokio::test]
    async fn serial_without_gpio_feature_is_unsupported() {
        let addr = SensorAddress::Serial {
            path: "/dev/ttyUSB0".into(),
            baud: 9600,
        };
        let err = Transport::open(&addr).await.err().unwrap();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }
}
