pub mod auth;
mod connection;
mod session;
pub mod server;

#[cfg(test)]
mod test {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use crate::config::SmtpSettings;
    use crate::smtp::auth::AuthPolicy;
    use crate::smtp::server::SmtpServer;
    use crate::store::memory::InMemoryStore;
    use crate::store::MessageStore;
    use crate::test::random_port;

    async fn setup_server(require_auth: bool) -> (CancellationToken, Arc<InMemoryStore>, u16) {
        let port = random_port();
        let store = Arc::new(InMemoryStore::new());
        let auth_policy = if require_auth {
            let mut credentials = std::collections::HashMap::new();
            credentials.insert("john".to_string(), password_auth::generate_hash(b"p4ssw0rd"));
            Arc::new(AuthPolicy::Required(Arc::new(crate::smtp::auth::StaticVerifier::new(credentials))))
        } else {
            Arc::new(AuthPolicy::Anonymous)
        };
        let shutdown = CancellationToken::new();

        let config = SmtpSettings {
            listen_addr: SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port).into(),
            ..Default::default()
        };

        let server = SmtpServer::new(config, "relay.test".to_string(), store.clone(), auth_policy, shutdown.clone());
        tokio::spawn(server.serve());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        (shutdown, store, port)
    }

    /// Reads one full SMTP reply, following continuation lines
    /// ("250-...") through to the final line ("250 ...").
    async fn read_reply(reader: &mut (impl AsyncBufReadExt + Unpin)) -> String {
        let mut full = String::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let is_final = line.len() < 4 || line.as_bytes()[3] != b'-';
            full.push_str(&line);
            if is_final {
                return full;
            }
        }
    }

    async fn command(reader: &mut (impl AsyncBufReadExt + Unpin), sink: &mut (impl AsyncWriteExt + Unpin), line: &str) -> String {
        sink.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
        read_reply(reader).await
    }

    #[tokio::test]
    #[traced_test]
    async fn anonymous_session_enqueues_message() {
        let (shutdown, store, port) = setup_server(false).await;

        let stream = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)).await.unwrap();
        let (read_half, mut sink) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        reader.read_line(&mut greeting).await.unwrap();
        assert!(greeting.starts_with("220"));

        assert!(command(&mut reader, &mut sink, "EHLO client.test").await.starts_with("250"));
        assert!(command(&mut reader, &mut sink, "MAIL FROM:<john@example.com>").await.starts_with("250"));
        assert!(command(&mut reader, &mut sink, "RCPT TO:<jane@example.com>").await.starts_with("250"));
        assert!(command(&mut reader, &mut sink, "DATA").await.starts_with("354"));

        let body = "From: John Doe <john@example.com>\r\nTo: Jane Doe <jane@example.com>\r\nSubject: Hi!\r\n\r\nHello, world!\r\n.\r\n";
        sink.write_all(body.as_bytes()).await.unwrap();
        assert!(read_reply(&mut reader).await.starts_with("250"));

        assert!(command(&mut reader, &mut sink, "QUIT").await.starts_with("221"));

        shutdown.cancel();

        let messages = store.query(Default::default()).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_email.to_string(), "john@example.com");
    }

    #[tokio::test]
    #[traced_test]
    async fn mail_from_before_auth_is_rejected() {
        let (shutdown, _store, port) = setup_server(true).await;

        let stream = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), port)).await.unwrap();
        let (read_half, mut sink) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut greeting = String::new();
        reader.read_line(&mut greeting).await.unwrap();

        assert!(command(&mut reader, &mut sink, "EHLO client.test").await.starts_with("250"));
        assert!(command(&mut reader, &mut sink, "MAIL FROM:<john@example.com>").await.starts_with("530"));

        shutdown.cancel();
    }
}
