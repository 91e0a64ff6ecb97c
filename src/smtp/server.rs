use std::fs::File;
use std::io;
use std::sync::Arc;

use rand::random_range;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, pki_types::{CertificateDer, PrivateKeyDer}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::SmtpSettings;
use crate::smtp::auth::AuthPolicy;
use crate::smtp::connection::{self, ConnectionError};
use crate::store::MessageStore;

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key file")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

pub struct SmtpServer {
    config: SmtpSettings,
    server_name: String,
    message_store: Arc<dyn MessageStore>,
    auth_policy: Arc<AuthPolicy>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    pub fn new(
        config: SmtpSettings,
        server_name: String,
        message_store: Arc<dyn MessageStore>,
        auth_policy: Arc<AuthPolicy>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { config, server_name, message_store, auth_policy, shutdown }
    }

    fn load_tls_material(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), SmtpServerError> {
        let cert_file = self.config.cert_file.as_ref().expect("STARTTLS requires cert_file");
        let key_file = self.config.key_file.as_ref().expect("STARTTLS requires key_file");

        let mut cert_reader = io::BufReader::new(File::open(cert_file).map_err(SmtpServerError::Certificate)?);
        let mut key_reader = io::BufReader::new(File::open(key_file).map_err(SmtpServerError::PrivateKey)?);

        let certs =
            rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, io::Error>>().map_err(SmtpServerError::Certificate)?;
        let key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(SmtpServerError::PrivateKey)?
            .ok_or(SmtpServerError::PrivateKeyNotFound)?;

        Ok((certs, key))
    }

    fn build_tls_acceptor(&self) -> Result<TlsAcceptor, SmtpServerError> {
        let (certs, key) = self.load_tls_material()?;

        let tls_config =
            rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key).map_err(SmtpServerError::Tls)?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    /// `None` when no cert/key pair is configured — `STARTTLS` is then
    /// simply not offered (spec §4.8: TLS is optional).
    fn initial_acceptor(&self) -> Result<Option<TlsAcceptor>, SmtpServerError> {
        if self.config.cert_file.is_some() && self.config.key_file.is_some() {
            Ok(Some(self.build_tls_acceptor()?))
        } else {
            Ok(None)
        }
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await.map_err(SmtpServerError::Listen)?;
        info!("smtp server on {}", self.config.listen_addr);

        let acceptor = self.initial_acceptor()?.map(|a| Arc::new(RwLock::new(a)));

        if let Some(acceptor) = acceptor.clone() {
            let reload_interval = std::time::Duration::from_secs(60 * 60 * 23 + random_range(0..(60 * 60)));
            debug!("automatically reloading the SMTP TLS certificate every {:?}", reload_interval);

            let config = self.config.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reload_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    info!("reloading the SMTP TLS certificate");
                    let refreshed = SmtpServer {
                        config: config.clone(),
                        server_name: String::new(),
                        message_store: Arc::new(crate::store::memory::InMemoryStore::new()),
                        auth_policy: Arc::new(AuthPolicy::Anonymous),
                        shutdown: CancellationToken::new(),
                    }
                    .build_tls_acceptor();
                    match refreshed {
                        Ok(new_acceptor) => *acceptor.write().await = new_acceptor,
                        Err(err) => error!("failed to reload SMTP TLS certificate: {err}"),
                    }
                }
            });
        }

        let server_name = Arc::new(self.server_name.clone());
        let message_store = self.message_store.clone();
        let auth_policy = self.auth_policy.clone();
        let max_body_bytes = self.config.max_body_bytes;
        let command_timeout = self.config.command_timeout();

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((mut stream, peer_addr)) => {
                        trace!(source_ip = peer_addr.ip().to_string(), source_port = peer_addr.port(), "new TCP connection");

                        let server_name = server_name.clone();
                        let message_store = message_store.clone();
                        let auth_policy = auth_policy.clone();
                        let acceptor = acceptor.clone();

                        tokio::spawn(async move {
                            let tls_guard = match &acceptor {
                                Some(lock) => Some(lock.read().await),
                                None => None,
                            };
                            let tls_ref = tls_guard.as_deref();

                            if let Err(err) = connection::handle(
                                &mut stream,
                                &server_name,
                                peer_addr,
                                message_store,
                                auth_policy,
                                max_body_bytes,
                                command_timeout,
                                tls_ref,
                            )
                            .await
                            {
                                match err {
                                    ConnectionError::Dropped | ConnectionError::Read(_) => {
                                        trace!("connection ended: {err}");
                                    }
                                    _ => error!("failed to handle connection: {err}"),
                                }
                            }
                        });
                    }
                    Err(err) => error!("failed to accept connection: {err}"),
                },
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {:?}", e);
            }
        });
    }
}
