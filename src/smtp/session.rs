use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64ct::Encoding;
use email_address::EmailAddress;
use mail_parser::MessageParser;
use smtp_proto::{
    AUTH_LOGIN, AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8,
    EXT_START_TLS, EhloResponse, Request,
};
use tracing::{debug, trace};

use crate::models::{Attachment, NewMessage, Recipient, RecipientKind};
use crate::smtp::auth::AuthPolicy;
use crate::store::MessageStore;

#[derive(Debug, Default)]
struct Envelope {
    from_email: String,
    recipients: Vec<EmailAddress>,
    raw_data: Vec<u8>,
}

enum PendingAuth {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
}

pub struct SmtpSession {
    message_store: Arc<dyn MessageStore>,
    auth_policy: Arc<AuthPolicy>,
    max_body_bytes: u64,
    tls_available: bool,
    tls_active: bool,

    peer_addr: SocketAddr,
    peer_name: Option<String>,
    authenticated_user: Option<String>,
    current_message: Option<Envelope>,
    pending_auth: Option<PendingAuth>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String),
    StartTls(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_AUTH_SUCCESS: &str = "2.7.0 Authentication succeeded.";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message queued for delivery";
    const RESPONSE_MESSAGE_REJECTED: &str = "5.6.0 Message rejected";
    const RESPONSE_STORE_UNAVAILABLE: &str = "4.3.0 Mail system temporarily unavailable";
    const RESPONSE_TOO_LARGE: &str = "5.3.4 Message too big";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NOVALID_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_ERROR: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTHENTICATION_REQUIRED: &str = "5.7.1 Authentication required";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";
    const RESPONSE_READY_FOR_TLS: &str = "2.0.0 Ready to start TLS";

    const DATA_END: &'static [u8] = b"\r\n.\r\n";

    pub fn new(
        peer_addr: SocketAddr,
        message_store: Arc<dyn MessageStore>,
        auth_policy: Arc<AuthPolicy>,
        max_body_bytes: u64,
        tls_available: bool,
    ) -> Self {
        Self {
            message_store,
            auth_policy,
            max_body_bytes,
            tls_available,
            tls_active: false,
            peer_addr,
            peer_name: None,
            authenticated_user: None,
            current_message: None,
            pending_auth: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    pub fn mark_tls_active(&mut self) {
        self.tls_active = true;
    }

    fn authenticated(&self) -> bool {
        !self.auth_policy.requires_auth() || self.authenticated_user.is_some()
    }

    pub async fn handle(&mut self, request: Result<Request<String>, smtp_proto::Error>) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                // RFC 4409, 4.1
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // Avoid logging `Request`'s `Debug` impl directly: it would
            // include the base64 credential payload.
            trace!("received AUTH with mechanism {mechanism} from {}", self.peer_addr);
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                // RFC5231, 4.1.1.1
                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8;
                if self.tls_available && !self.tls_active {
                    response.capabilities |= EXT_START_TLS;
                }
                if self.auth_policy.requires_auth() {
                    response.capabilities |= EXT_AUTH;
                    response.auth_mechanisms = AUTH_PLAIN | AUTH_LOGIN;
                }

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);

                SessionReply::RawReply(buf)
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::StartTls => {
                if self.tls_active {
                    return SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into());
                }
                if !self.tls_available {
                    return SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into());
                }
                SessionReply::StartTls(220, Self::RESPONSE_READY_FOR_TLS.into())
            }
            Request::Auth { mechanism, initial_response } => {
                // RFC 4954
                if self.authenticated_user.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_ALREADY_AUTHENTICATED.into());
                }

                if mechanism == AUTH_PLAIN {
                    if initial_response.is_empty() {
                        self.pending_auth = Some(PendingAuth::Plain);
                        return SessionReply::IngestAuth(334, "Tell me your secret.".into());
                    }
                    let (code, message) = self.handle_plain_auth(&mut initial_response.into_bytes()).await;
                    SessionReply::ReplyAndContinue(code, message)
                } else if mechanism == AUTH_LOGIN {
                    self.pending_auth = Some(PendingAuth::LoginUsername);
                    SessionReply::IngestAuth(334, "VXNlcm5hbWU6".into())
                } else {
                    debug!("received unsupported AUTH request");
                    SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
                }
            }
            Request::Quit => {
                // RFC5321, 4.1.1.10
                SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into())
            }
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => {
                // RFC5231, 4.1.1.2
                debug!("received MAIL FROM: {}", from.address);

                if !self.authenticated() {
                    return SessionReply::ReplyAndContinue(530, Self::RESPONSE_AUTHENTICATION_REQUIRED.into());
                }

                if from.address.parse::<EmailAddress>().is_err() {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_SENDER.into());
                }

                if self.current_message.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                self.current_message = Some(Envelope { from_email: from.address.clone(), ..Default::default() });

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => {
                // RFC5231, 4.1.1.3
                debug!("received RCPT TO: {}", to.address);

                let Ok(to_address) = to.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(553, Self::RESPONSE_INVALID_EMAIL.into());
                };

                let Some(envelope) = self.current_message.as_mut() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                };

                envelope.recipients.push(to_address);

                let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Bdat { .. } => SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into()),
            Request::Noop { value: _ } => {
                // RFC5321, 4.1.1.9
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Data => {
                // RFC5231, 4.1.1.4
                let Some(Envelope { recipients, .. }) = self.current_message.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };

                if recipients.is_empty() {
                    return SessionReply::ReplyAndContinue(554, Self::RESPONSE_NOVALID_RECIPIENTS.into());
                }

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                // RFC5321, 4.1.1.5. Does not clear AUTH or EHLO status.
                self.current_message = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { value: _ } => {
                // RFC5321, 4.1.1.6
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Expn { value: _ } | Request::Help { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    fn decode_base64_line(data: &mut [u8]) -> Option<Vec<u8>> {
        let ascii_len = data.trim_ascii_end().len();
        let data = &mut data[..ascii_len];
        base64ct::Base64::decode_in_place(data).ok().map(<[u8]>::to_vec)
    }

    fn decode_plain_auth(data: &mut [u8]) -> Option<(String, String)> {
        let decoded = Self::decode_base64_line(data)?;
        let mut parts = decoded.split(|&b| b == 0);

        let authcid = parts.next()?;
        if authcid != b"" {
            trace!("ignoring received authcid: {}", String::from_utf8_lossy(authcid));
        }
        let username = parts.next()?;
        let password = parts.next()?;
        if parts.count() != 0 {
            return None;
        }

        let username = std::str::from_utf8(username).ok()?.to_string();
        let password = std::str::from_utf8(password).ok()?.to_string();
        Some((username, password))
    }

    pub(super) async fn handle_plain_auth(&mut self, data: &mut [u8]) -> (u16, String) {
        let Some((username, password)) = Self::decode_plain_auth(data) else {
            return (501, Self::RESPONSE_SYNTAX_ERROR.into());
        };
        self.finish_auth(&username, &password).await
    }

    async fn finish_auth(&mut self, username: &str, password: &str) -> (u16, String) {
        trace!("decoded credentials, username: {username} password ({} characters)", password.len());

        match self.auth_policy.verify(username, password).await {
            Some(identity) => {
                self.authenticated_user = Some(identity);
                (235, Self::RESPONSE_AUTH_SUCCESS.into())
            }
            None => (535, Self::RESPONSE_AUTH_ERROR.into()),
        }
    }

    /// Handles a line ingested while `pending_auth` is set (the
    /// continuation of an `AUTH PLAIN`/`LOGIN` exchange).
    pub async fn handle_auth_continuation(&mut self, data: &mut [u8]) -> (u16, String) {
        match self.pending_auth.take() {
            None | Some(PendingAuth::Plain) => self.handle_plain_auth(data).await,
            Some(PendingAuth::LoginUsername) => {
                let Some(decoded) = Self::decode_base64_line(data) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let Ok(username) = String::from_utf8(decoded) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                self.pending_auth = Some(PendingAuth::LoginPassword { username });
                (334, "UGFzc3dvcmQ6".into())
            }
            Some(PendingAuth::LoginPassword { username }) => {
                let Some(decoded) = Self::decode_base64_line(data) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                let Ok(password) = String::from_utf8(decoded) else {
                    return (501, Self::RESPONSE_SYNTAX_ERROR.into());
                };
                self.finish_auth(&username, &password).await
            }
        }
    }

    pub async fn handle_data(&mut self, data: &[u8]) -> DataReply {
        let Some(Envelope { raw_data: buffer, .. }) = self.current_message.as_mut() else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        buffer.extend_from_slice(data);

        if buffer.len() as u64 > self.max_body_bytes {
            debug!("failed to read message: message too big");
            self.current_message = None;
            // RFC 5321, 4.5.3.1.9 — `552` is the size-limit status.
            return DataReply::ReplyAndContinue(552, Self::RESPONSE_TOO_LARGE.into());
        }

        if buffer.ends_with(Self::DATA_END) || buffer.as_slice() == &Self::DATA_END[2..] {
            buffer.truncate(buffer.len() - Self::DATA_END.len());

            let Some(envelope) = self.current_message.take() else {
                return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
            };

            trace!("received message ({} bytes)", envelope.raw_data.len());

            let new_message = match self.build_new_message(envelope) {
                Ok(msg) => msg,
                Err(()) => return DataReply::ReplyAndContinue(554, Self::RESPONSE_MESSAGE_REJECTED.into()),
            };

            return match self.message_store.enqueue(new_message).await {
                Ok(_id) => DataReply::ReplyAndContinue(250, Self::RESPONSE_MESSAGE_ACCEPTED.into()),
                Err(error) => {
                    debug!("failed to enqueue message: {error}");
                    DataReply::ReplyAndContinue(451, Self::RESPONSE_STORE_UNAVAILABLE.into())
                }
            };
        }

        DataReply::ContinueIngest
    }

    fn flat_addresses(address: Option<&mail_parser::Address<'_>>) -> Vec<String> {
        address
            .map(|addr| addr.iter().filter_map(|a| a.address.as_deref()).map(str::to_lowercase).collect())
            .unwrap_or_default()
    }

    fn header_value_to_string(value: &mail_parser::HeaderValue<'_>) -> String {
        match value {
            mail_parser::HeaderValue::Text(text) => text.to_string(),
            mail_parser::HeaderValue::TextList(list) => list.join(", "),
            mail_parser::HeaderValue::Address(address) => {
                address.iter().filter_map(format_addr).collect::<Vec<_>>().join(", ")
            }
            mail_parser::HeaderValue::DateTime(dt) => dt.to_rfc3339(),
            mail_parser::HeaderValue::ContentType(ct) => ct.c_type.to_string(),
            _ => String::new(),
        }
    }

    /// Parses the raw DATA payload into headers + bodies (spec §4.8):
    /// recipients are tagged To/Cc/Bcc by cross-referencing the
    /// envelope RCPT list against the parsed `To`/`Cc`/`Bcc` headers,
    /// and any `Bcc:` header is stripped before storage so it is never
    /// forwarded to a provider or another recipient.
    fn build_new_message(&self, envelope: Envelope) -> Result<NewMessage, ()> {
        let parsed = MessageParser::default().parse(&envelope.raw_data).ok_or(())?;

        let bcc_addresses = Self::flat_addresses(parsed.bcc());
        let cc_addresses = Self::flat_addresses(parsed.cc());

        let recipients = envelope
            .recipients
            .into_iter()
            .map(|address| {
                let lower = address.as_str().to_lowercase();
                let kind = if bcc_addresses.contains(&lower) {
                    RecipientKind::Bcc
                } else if cc_addresses.contains(&lower) {
                    RecipientKind::Cc
                } else {
                    RecipientKind::To
                };
                Recipient { address, kind }
            })
            .collect();

        // `Bcc:` is envelope-only information; stripping it here keeps it
        // from ever being forwarded to a provider or another recipient.
        let headers: Vec<(String, String)> = parsed
            .parts
            .first()
            .map(|root| {
                root.headers
                    .iter()
                    .filter(|header| !header.name.as_str().eq_ignore_ascii_case("bcc"))
                    .map(|header| (header.name.as_str().to_string(), Self::header_value_to_string(&header.value)))
                    .collect()
            })
            .unwrap_or_default();

        let subject = parsed.subject().map(str::to_string);
        let text_body = parsed.body_text(0).map(|b| b.to_string());
        let html_body = parsed.body_html(0).map(|b| b.to_string());

        let attachments = parsed
            .attachments()
            .map(|attachment| {
                let content_type = attachment
                    .content_type()
                    .map(|ct| format!("{}/{}", ct.c_type, ct.c_subtype.as_deref().unwrap_or("octet-stream")))
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                Attachment {
                    filename: attachment.attachment_name().unwrap_or("attachment").to_string(),
                    content_type,
                    content: attachment.contents().to_vec(),
                }
            })
            .collect();

        Ok(NewMessage {
            client_id: None,
            from_email: envelope.from_email,
            recipients,
            headers,
            subject,
            text_body,
            html_body,
            attachments,
            user_id: self.authenticated_user.clone(),
            metadata: BTreeMap::new(),
        })
    }
}

fn format_addr(addr: &mail_parser::Addr<'_>) -> Option<String> {
    let address = addr.address.as_deref()?;
    match addr.name.as_deref() {
        Some(name) if !name.trim().is_empty() => Some(format!("{name} <{address}>")),
        _ => Some(address.to_string()),
    }
}
