//! SMTP server implementation

use crate::pipeline::Orchestrator;
use crate::smtp::SmtpHandler;
use anyhow::Result;
use mailpost_common::config::SmtpConfig;
use mailpost_common::Error;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// SMTP Server
pub struct SmtpServer {
    config: SmtpConfig,
    orchestrator: Arc<Orchestrator>,
    connection_semaphore: Arc<Semaphore>,
    resolver: Option<TokioAsyncResolver>,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(config: SmtpConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let resolver = config
            .reverse_dns
            .then(|| TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()));

        Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            orchestrator,
            resolver,
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> mailpost_common::Result<TcpListener> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        TcpListener::bind(&addr).await.map_err(|e| {
            let hint = if self.config.port < 1024 {
                " (ports below 1024 usually need elevated privileges)"
            } else {
                ""
            };
            Error::Smtp(format!("Failed to listen on {}: {}{}", addr, e, hint))
        })
    }

    /// Accept connections until the task is cancelled
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("SMTP server listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((mut stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            tokio::spawn(async move {
                                let _ = stream
                                    .write_all(b"421 4.3.2 Too many connections, try again later\r\n")
                                    .await;
                                let _ = stream.shutdown().await;
                            });
                            continue;
                        }
                    };

                    let server = Arc::clone(&self);

                    tokio::spawn(async move {
                        let remote_host = server.remote_host(peer_addr.ip()).await;
                        info!(peer = %peer_addr, remote_host = %remote_host, "Connection opened");

                        let handler = SmtpHandler::new(
                            server.config.clone(),
                            Arc::clone(&server.orchestrator),
                            peer_addr,
                            remote_host,
                        );

                        if let Err(e) = handler.handle(stream).await {
                            error!("SMTP session error from {}: {}", peer_addr, e);
                        }

                        info!(peer = %peer_addr, "Connection closed");
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Bind and serve
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Name of the peer from reverse DNS, or the bracketed address literal
    async fn remote_host(&self, ip: IpAddr) -> String {
        let literal = format!("[{}]", ip);

        let Some(resolver) = &self.resolver else {
            return literal;
        };

        match resolver.reverse_lookup(ip).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or(literal),
            Err(e) => {
                debug!("Reverse lookup for {} failed: {}", ip, e);
                literal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSettings;
    use crate::pipeline::tests::{guess, orchestrator, FakeValidator, FixedDetector};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::TcpStream;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(max_connections: usize) -> SmtpConfig {
        SmtpConfig {
            hostname: "mx.test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            reverse_dns: false,
            ..SmtpConfig::default()
        }
    }

    async fn read_reply(reader: &mut BufReader<TcpStream>) -> String {
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if line.as_bytes().get(3) != Some(&b'-') {
                return line.trim_end().to_string();
            }
        }
    }

    async fn command(reader: &mut BufReader<TcpStream>, line: &str) -> String {
        reader.get_mut().write_all(line.as_bytes()).await.unwrap();
        reader.get_mut().write_all(b"\r\n").await.unwrap();
        read_reply(reader).await
    }

    #[tokio::test]
    async fn test_message_is_acknowledged_and_delivered() {
        let webhook = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&webhook)
            .await;

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &dir,
            webhook.uri(),
            Arc::new(FakeValidator::default()),
            AuthSettings::unavailable(),
            FixedDetector(vec![guess("eng", 0.9)]),
        );

        let server = Arc::new(SmtpServer::new(config(10), orchestrator));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(Arc::clone(&server).serve(listener));

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        assert!(read_reply(&mut client).await.starts_with("220 mx.test"));
        assert!(command(&mut client, "EHLO client.test").await.starts_with("250"));
        assert!(command(&mut client, "MAIL FROM:<alice@sender.example>")
            .await
            .starts_with("250"));
        assert!(command(&mut client, "RCPT TO:<inbox@receiver.example>")
            .await
            .starts_with("250"));
        assert!(command(&mut client, "DATA").await.starts_with("354"));

        let reply = command(
            &mut client,
            "Subject: Hello\r\nContent-Type: text/html\r\n\r\n<p>Hi</p>\r\n..dot\r\n.",
        )
        .await;
        assert!(reply.starts_with("250 2.0.0 OK: queued as "), "{}", reply);
        let staging_id = reply.rsplit(' ').next().unwrap().to_string();
        assert_eq!(staging_id.len(), 40);

        assert!(command(&mut client, "QUIT").await.starts_with("221"));

        // Wait for the detached pipeline to post and clean up
        for _ in 0..100 {
            let posted = !webhook.received_requests().await.unwrap_or_default().is_empty();
            let cleaned = std::fs::read_dir(dir.path()).unwrap().count() == 0;
            if posted && cleaned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let requests = webhook.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains(&staging_id));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        serving.abort();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &dir,
            "http://127.0.0.1:9/unused".to_string(),
            Arc::new(FakeValidator::default()),
            AuthSettings::unavailable(),
            FixedDetector(vec![]),
        );

        let server = Arc::new(SmtpServer::new(config(1), orchestrator));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn(Arc::clone(&server).serve(listener));

        let mut first = BufReader::new(TcpStream::connect(addr).await.unwrap());
        assert!(read_reply(&mut first).await.starts_with("220"));

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut reply = String::new();
        second.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("421"));

        serving.abort();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &dir,
            "http://127.0.0.1:9/unused".to_string(),
            Arc::new(FakeValidator::default()),
            AuthSettings::unavailable(),
            FixedDetector(vec![]),
        );

        let server = SmtpServer::new(SmtpConfig { port, ..config(1) }, orchestrator);
        let err = server.bind().await.unwrap_err();
        assert!(matches!(err, Error::Smtp(_)));
        assert!(err.to_string().contains(&port.to_string()));
    }

    #[tokio::test]
    async fn test_remote_host_without_resolver() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &dir,
            "http://127.0.0.1:9/unused".to_string(),
            Arc::new(FakeValidator::default()),
            AuthSettings::unavailable(),
            FixedDetector(vec![]),
        );

        let server = SmtpServer::new(config(1), orchestrator);
        assert_eq!(
            server.remote_host("192.0.2.7".parse().unwrap()).await,
            "[192.0.2.7]"
        );
    }
}
