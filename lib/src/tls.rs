//! Client side TLS, delegated to rustls.
//!
//! The harness never acts as a TLS server: the origin behind the system
//! under test speaks plain HTTP, only the downstream client may need TLS.
//! Trust is either a CA file or no verification at all, since test setups
//! mostly run on self-signed certificates.

use std::{
    fs::File,
    io::{self, BufReader, ErrorKind, Read, Write},
    sync::Arc,
};

use mio::net::TcpStream;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tandem_command_lib::config::TlsSettings;

use crate::socket::{classify, SocketHandler, SocketResult, TransportProtocol};

#[derive(thiserror::Error, Debug)]
pub enum TlsError {
    #[error("could not read the CA file {path}: {error}")]
    CaFile { path: String, error: io::Error },
    #[error("no certificate found in {0}")]
    EmptyCaFile(String),
    #[error("invalid server name {0}")]
    InvalidServerName(String),
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Accepts any certificate, the signatures of the handshake are still checked
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn load_roots(path: &str) -> Result<RootCertStore, TlsError> {
    let file = File::open(path).map_err(|error| TlsError::CaFile {
        path: path.to_owned(),
        error,
    })?;
    let mut reader = BufReader::new(file);
    let mut roots = RootCertStore::empty();
    for certificate in rustls_pemfile::certs(&mut reader) {
        let certificate = certificate.map_err(|error| TlsError::CaFile {
            path: path.to_owned(),
            error,
        })?;
        roots.add(certificate)?;
    }
    if roots.is_empty() {
        return Err(TlsError::EmptyCaFile(path.to_owned()));
    }
    Ok(roots)
}

pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = Arc::new(crypto::ring::default_provider());
    let builder =
        ClientConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let mut config = match (&settings.ca_file, settings.verify) {
        (Some(path), true) => {
            let roots = load_roots(&path.to_string_lossy())?;
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        _ => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth(),
    };
    config.alpn_protocols = settings
        .alpn
        .iter()
        .map(|protocol| protocol.as_bytes().to_vec())
        .collect();

    Ok(Arc::new(config))
}

pub fn server_name(settings: &TlsSettings) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(settings.server_name.as_str())
        .map(|name| name.to_owned())
        .map_err(|_| TlsError::InvalidServerName(settings.server_name.clone()))
}

/// A TCP stream with a rustls client session on top
pub struct TlsClientStream {
    pub stream: TcpStream,
    pub session: ClientConnection,
}

impl TlsClientStream {
    pub fn new(stream: TcpStream, settings: &TlsSettings) -> Result<Self, TlsError> {
        let session = ClientConnection::new(client_config(settings)?, server_name(settings)?)?;
        Ok(TlsClientStream { stream, session })
    }

    /// the protocol chosen by ALPN, once the handshake is done
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.session.alpn_protocol()
    }

    pub fn send_close_notify(&mut self) {
        self.session.send_close_notify();
        let _ = self.flush_tls();
    }

    fn flush_tls(&mut self) -> SocketResult {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(0) => return SocketResult::Closed,
                Ok(_) => {}
                Err(e) => return classify(e),
            }
        }
        SocketResult::Continue
    }
}

impl SocketHandler for TlsClientStream {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        loop {
            match self.session.reader().read(buf) {
                Ok(0) if !buf.is_empty() => return (0, SocketResult::Closed),
                Ok(size) => return (size, SocketResult::Continue),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return (0, SocketResult::Closed)
                }
                Err(e) => return (0, classify(e)),
            }

            match self.session.read_tls(&mut self.stream) {
                Ok(0) => return (0, SocketResult::Closed),
                Ok(_) => {}
                Err(e) => return (0, classify(e)),
            }
            if let Err(e) = self.session.process_new_packets() {
                error!("TLS\tinvalid record from the peer: {}", e);
                // let the alert reach the peer before giving up
                let _ = self.flush_tls();
                return (0, SocketResult::Fatal(io::Error::new(ErrorKind::InvalidData, e)));
            }
            // handshake messages may need an answer
            if let SocketResult::Fatal(e) = self.flush_tls() {
                return (0, SocketResult::Fatal(e));
            }
        }
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        let mut size = 0;
        if !buf.is_empty() {
            // plaintext is buffered by rustls until the handshake completes
            match self.session.writer().write(buf) {
                Ok(written) => size = written,
                Err(e) => return (0, classify(e)),
            }
        }
        (size, self.flush_tls())
    }

    fn socket_ref(&self) -> &TcpStream {
        &self.stream
    }

    fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tls
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{SocketAddr, TcpListener as StdListener},
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    };

    use rustls::{ServerConfig, ServerConnection, StreamOwned};
    use serial_test::serial;

    use super::*;
    use crate::{
        endpoint::{ConnectOptions, Endpoint},
        reactor::{Notification, Reactor, ReactorError},
    };

    const CA_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets/local-ca.pem");

    /// TLS server for one connection on a thread: answers `pong` to `ping`,
    /// then waits for the client to leave. Yields the negotiated protocol,
    /// `None` when the exchange failed.
    fn tls_origin(alpn: &[&str]) -> (SocketAddr, JoinHandle<Option<Vec<u8>>>) {
        let certificates =
            rustls_pemfile::certs(&mut include_bytes!("../assets/local-certificate.pem").as_slice())
                .collect::<Result<Vec<_>, _>>()
                .unwrap();
        let key = rustls_pemfile::private_key(&mut include_bytes!("../assets/local-key.pem").as_slice())
            .unwrap()
            .unwrap();
        let mut config = ServerConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(certificates, key)
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|protocol| protocol.as_bytes().to_vec()).collect();

        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().ok()?;
            let session = ServerConnection::new(Arc::new(config)).ok()?;
            let mut tls = StreamOwned::new(session, stream);
            let mut buffer = [0; 4];
            tls.read_exact(&mut buffer).ok()?;
            if &buffer != b"ping" {
                return None;
            }
            tls.write_all(b"pong").ok()?;
            tls.flush().ok()?;
            let _ = tls.read(&mut buffer);
            tls.conn.alpn_protocol().map(<[u8]>::to_vec)
        });
        (address, handle)
    }

    fn verified(server_name: &str) -> ConnectOptions {
        ConnectOptions {
            tls: Some(TlsSettings {
                server_name: server_name.to_owned(),
                ca_file: Some(CA_FILE.into()),
                verify: true,
                ..settings()
            }),
            ..ConnectOptions::default()
        }
    }

    #[test]
    #[serial]
    fn exchange_over_a_verified_session() {
        let (address, origin) = tls_origin(&["h2"]);
        let mut reactor = Reactor::new().unwrap();
        let endpoint = Endpoint::connect(address, &verified("localhost")).unwrap();
        let token = reactor.register(endpoint).unwrap();
        // buffered by rustls until the handshake completes
        reactor.queue(token, b"ping").unwrap();

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received != b"pong" {
            assert!(Instant::now() < deadline, "received {received:?}");
            for notification in reactor.run_once(Duration::from_millis(10)).unwrap() {
                if let Notification::Received(_, data) = notification {
                    received.extend(data);
                }
            }
        }
        let endpoint = reactor.endpoint(token).unwrap();
        assert_eq!(endpoint.alpn_protocol(), Some(b"h2".to_vec()));

        reactor.close(token);
        reactor.run_once(Duration::ZERO).unwrap();
        assert_eq!(origin.join().unwrap(), Some(b"h2".to_vec()));
    }

    #[test]
    #[serial]
    fn certificate_for_another_name_is_fatal() {
        let (address, origin) = tls_origin(&["h2"]);
        let mut reactor = Reactor::new().unwrap();
        let endpoint = Endpoint::connect(address, &verified("example.com")).unwrap();
        let token = reactor.register(endpoint).unwrap();
        reactor.queue(token, b"ping").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let error = loop {
            assert!(Instant::now() < deadline, "handshake did not fail");
            match reactor.run_once(Duration::from_millis(10)) {
                Ok(notifications) => assert!(!notifications
                    .iter()
                    .any(|n| matches!(n, Notification::Received(..)))),
                Err(error) => break error,
            }
        };
        assert!(matches!(error, ReactorError::Fatal { token: failed, .. } if failed == token));
        assert!(reactor.endpoint(token).is_none());
        assert_eq!(origin.join().unwrap(), None);
    }

    fn settings() -> TlsSettings {
        TlsSettings {
            alpn: vec!["h2".to_owned(), "http/1.1".to_owned()],
            server_name: "example.com".to_owned(),
            ca_file: None,
            verify: false,
        }
    }

    #[test]
    fn alpn_is_configured() {
        let config = client_config(&settings()).expect("valid settings");
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn missing_ca_file() {
        let settings = TlsSettings {
            ca_file: Some("/nonexistent/ca.pem".into()),
            verify: true,
            ..settings()
        };
        assert!(matches!(
            client_config(&settings),
            Err(TlsError::CaFile { .. })
        ));
    }

    #[test]
    fn server_name_validation() {
        assert!(server_name(&settings()).is_ok());
        let invalid = TlsSettings {
            server_name: "not a host name".to_owned(),
            ..settings()
        };
        assert!(matches!(
            server_name(&invalid),
            Err(TlsError::InvalidServerName(_))
        ));
    }
}
