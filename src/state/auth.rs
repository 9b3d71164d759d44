//! Authentication negotiation.
//!
//! Answers the server's authentication requests: cleartext password, MD5 and
//! SCRAM-SHA-256. Kerberos, GSSAPI and SSPI are refused rather than guessed.

use crate::error::{Error, Result};
use crate::protocol::backend::AuthenticationMessage;
use crate::protocol::frontend::auth::{SCRAM_SHA_256, ScramClient};
use crate::protocol::frontend::{
    md5_password, write_password, write_sasl_initial_response, write_sasl_response,
};

/// What the connection should do after an authentication message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    /// A response was appended to the write buffer; send it and read on.
    Respond,
    /// Nothing to send; read the next message.
    Continue,
    /// AuthenticationOk received.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    PasswordSent,
    SaslInitialSent,
    SaslResponseSent,
    SaslVerified,
    Done,
}

/// Client side of the authentication exchange.
pub struct AuthNegotiator {
    user: String,
    password: Option<String>,
    scram: Option<ScramClient>,
    state: State,
}

impl AuthNegotiator {
    pub fn new(user: &str, password: Option<&str>) -> Self {
        Self {
            user: user.to_string(),
            password: password.map(str::to_string),
            scram: None,
            state: State::Initial,
        }
    }

    /// Whether AuthenticationOk has been received.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn password(&self, method: &str) -> Result<&str> {
        self.password.as_deref().ok_or_else(|| {
            Error::Auth(format!(
                "server requested {method} but no password was provided"
            ))
        })
    }

    /// Handle one Authentication message, appending any response to `out`.
    pub fn handle(
        &mut self,
        message: AuthenticationMessage<'_>,
        out: &mut Vec<u8>,
    ) -> Result<AuthStep> {
        match (self.state, message) {
            (
                State::Initial | State::PasswordSent | State::SaslVerified,
                AuthenticationMessage::Ok,
            ) => {
                self.state = State::Done;
                Ok(AuthStep::Done)
            }
            (State::SaslInitialSent | State::SaslResponseSent, AuthenticationMessage::Ok) => Err(
                Error::Auth("server accepted the login without completing SCRAM".into()),
            ),
            (State::Initial, AuthenticationMessage::CleartextPassword) => {
                tracing::debug!("authenticating with cleartext password");
                let password = self.password("a cleartext password")?;
                write_password(out, password);
                self.state = State::PasswordSent;
                Ok(AuthStep::Respond)
            }
            (State::Initial, AuthenticationMessage::Md5Password { salt }) => {
                tracing::debug!("authenticating with MD5 password");
                let hashed = md5_password(&self.user, self.password("an MD5 password")?, &salt);
                write_password(out, &hashed);
                self.state = State::PasswordSent;
                Ok(AuthStep::Respond)
            }
            (State::Initial, AuthenticationMessage::Sasl { mechanisms }) => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::UnsupportedAuthMethod(format!(
                        "SASL mechanisms {mechanisms:?}"
                    )));
                }
                tracing::debug!("authenticating with {}", SCRAM_SHA_256);
                let scram = ScramClient::new(self.password("SCRAM-SHA-256 authentication")?);
                write_sasl_initial_response(
                    out,
                    SCRAM_SHA_256,
                    scram.client_first_message().as_bytes(),
                );
                self.scram = Some(scram);
                self.state = State::SaslInitialSent;
                Ok(AuthStep::Respond)
            }
            (State::SaslInitialSent, AuthenticationMessage::SaslContinue { data }) => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-first-message: {e}")))?;
                let client_final = scram.process_server_first(server_first)?;
                write_sasl_response(out, client_final.as_bytes());
                self.state = State::SaslResponseSent;
                Ok(AuthStep::Respond)
            }
            (State::SaslResponseSent, AuthenticationMessage::SaslFinal { data }) => {
                let scram = self
                    .scram
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("invalid server-final-message: {e}")))?;
                scram.verify_server_final(server_final)?;
                self.state = State::SaslVerified;
                Ok(AuthStep::Continue)
            }
            (
                _,
                message @ (AuthenticationMessage::KerberosV5
                | AuthenticationMessage::Gss
                | AuthenticationMessage::GssContinue { .. }
                | AuthenticationMessage::Sspi),
            ) => Err(Error::UnsupportedAuthMethod(message.method_name().into())),
            (state, message) => Err(Error::Protocol(format!(
                "unexpected {} authentication request in state {state:?}",
                message.method_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frontend::auth::{
        parse_password, parse_sasl_initial_response, scram_server_final,
    };

    fn payload(out: &[u8]) -> &[u8] {
        assert_eq!(out[0], b'p');
        &out[5..]
    }

    fn sasl_request() -> AuthenticationMessage<'static> {
        AuthenticationMessage::Sasl {
            mechanisms: vec![SCRAM_SHA_256],
        }
    }

    #[test]
    fn trust_needs_nothing() {
        let mut auth = AuthNegotiator::new("alice", None);
        let mut out = Vec::new();
        assert_eq!(
            auth.handle(AuthenticationMessage::Ok, &mut out).unwrap(),
            AuthStep::Done
        );
        assert!(out.is_empty());
        assert!(auth.is_done());
    }

    #[test]
    fn cleartext() {
        let mut auth = AuthNegotiator::new("alice", Some("pw"));
        let mut out = Vec::new();
        let step = auth
            .handle(AuthenticationMessage::CleartextPassword, &mut out)
            .unwrap();
        assert_eq!(step, AuthStep::Respond);
        assert_eq!(parse_password(payload(&out)).unwrap(), "pw");
        assert_eq!(
            auth.handle(AuthenticationMessage::Ok, &mut out).unwrap(),
            AuthStep::Done
        );
    }

    #[test]
    fn md5() {
        let mut auth = AuthNegotiator::new("postgres", Some("password"));
        let mut out = Vec::new();
        auth.handle(
            AuthenticationMessage::Md5Password { salt: [1, 2, 3, 4] },
            &mut out,
        )
        .unwrap();
        assert_eq!(
            parse_password(payload(&out)).unwrap(),
            "md598511ceaec347a656f032c7f2a16ef17"
        );
    }

    #[test]
    fn missing_password() {
        let mut auth = AuthNegotiator::new("alice", None);
        let err = auth
            .handle(AuthenticationMessage::CleartextPassword, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn unsupported_methods() {
        for message in [
            AuthenticationMessage::KerberosV5,
            AuthenticationMessage::Gss,
            AuthenticationMessage::Sspi,
        ] {
            let mut auth = AuthNegotiator::new("alice", Some("pw"));
            let err = auth.handle(message, &mut Vec::new()).unwrap_err();
            assert!(matches!(err, Error::UnsupportedAuthMethod(_)));
        }
        let mut auth = AuthNegotiator::new("alice", Some("pw"));
        let err = auth
            .handle(
                AuthenticationMessage::Sasl {
                    mechanisms: vec!["SCRAM-SHA-256-PLUS"],
                },
                &mut Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAuthMethod(_)));
    }

    #[test]
    fn scram_full_exchange() {
        let password = "pencil";
        let salt = b"0123456789abcdef";
        let mut auth = AuthNegotiator::new("alice", Some(password));

        let mut out = Vec::new();
        auth.handle(sasl_request(), &mut out).unwrap();
        let (mechanism, data) = parse_sasl_initial_response(payload(&out)).unwrap();
        assert_eq!(mechanism, SCRAM_SHA_256);
        let client_first = std::str::from_utf8(data.unwrap()).unwrap().to_string();
        let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
        let client_nonce = client_first_bare.strip_prefix("n=,r=").unwrap();

        use base64::Engine;
        let server_first = format!(
            "r={client_nonce}srv,s={},i=4096",
            base64::engine::general_purpose::STANDARD.encode(salt)
        );
        out.clear();
        let step = auth
            .handle(
                AuthenticationMessage::SaslContinue {
                    data: server_first.as_bytes(),
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(step, AuthStep::Respond);
        let client_final = std::str::from_utf8(payload(&out)).unwrap().to_string();
        let server_final = scram_server_final(
            password,
            salt,
            4096,
            &client_first_bare,
            &server_first,
            &client_final,
        )
        .unwrap();

        // Skipping the final message is refused.
        let mut early = AuthNegotiator::new("alice", Some(password));
        early.handle(sasl_request(), &mut Vec::new()).unwrap();
        assert!(early.handle(AuthenticationMessage::Ok, &mut Vec::new()).is_err());

        let step = auth
            .handle(
                AuthenticationMessage::SaslFinal {
                    data: server_final.as_bytes(),
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(step, AuthStep::Continue);
        assert_eq!(
            auth.handle(AuthenticationMessage::Ok, &mut out).unwrap(),
            AuthStep::Done
        );
    }

    #[test]
    fn scram_rejects_bad_server_signature() {
        let mut auth = AuthNegotiator::new("alice", Some("pencil"));
        let mut out = Vec::new();
        auth.handle(sasl_request(), &mut out).unwrap();
        let (_, data) = parse_sasl_initial_response(payload(&out)).unwrap();
        let nonce = std::str::from_utf8(data.unwrap())
            .unwrap()
            .strip_prefix("n,,n=,r=")
            .unwrap()
            .to_string();
        let server_first = format!("r={nonce}x,s=QSXCR+Q6sek8bf92,i=4096");
        auth.handle(
            AuthenticationMessage::SaslContinue {
                data: server_first.as_bytes(),
            },
            &mut Vec::new(),
        )
        .unwrap();
        let err = auth
            .handle(
                AuthenticationMessage::SaslFinal {
                    data: b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=",
                },
                &mut Vec::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
