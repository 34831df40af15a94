//! Backend authentication: session credentials, the native password
//! scramble and the pluggable authenticator used while a backend connection
//! is in AUTHENTICATING or answering a COM_CHANGE_USER.

use sha1::{Digest, Sha1};

use crate::constants::{DEFAULT_AUTH_PLUGIN, DEFAULT_CHARSET, SCRAMBLE_LEN, SHA1_LEN};
use crate::protocol::{self, AuthSwitchRequest, Packet};

/// Identity a session presents to backend servers.
///
/// The clear-text password is never stored: the proxy keeps `SHA1(password)`,
/// which is all the native password scramble needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password_sha1: Option<[u8; SHA1_LEN]>,
    pub database: Option<String>,
    pub charset: u8,
    pub auth_plugin: String,
    pub connect_attrs: Vec<u8>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: &str) -> Self {
        Self {
            user: user.into(),
            password_sha1: (!password.is_empty()).then(|| sha1(&[password.as_bytes()])),
            database: None,
            charset: DEFAULT_CHARSET,
            auth_plugin: DEFAULT_AUTH_PLUGIN.to_string(),
            connect_attrs: Vec::new(),
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Native password token for `scramble`, empty for password-less accounts.
    pub fn token_for(&self, scramble: &[u8; SCRAMBLE_LEN]) -> Vec<u8> {
        match &self.password_sha1 {
            Some(hash1) => scramble_password(scramble, hash1).to_vec(),
            None => Vec::new(),
        }
    }
}

pub fn sha1(parts: &[&[u8]]) -> [u8; SHA1_LEN] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`.
pub fn scramble_password(
    scramble: &[u8; SCRAMBLE_LEN],
    password_sha1: &[u8; SHA1_LEN],
) -> [u8; SHA1_LEN] {
    let hash2 = sha1(&[password_sha1]);
    let mask = sha1(&[scramble, &hash2]);
    let mut token = [0u8; SHA1_LEN];
    for (i, byte) in token.iter_mut().enumerate() {
        *byte = password_sha1[i] ^ mask[i];
    }
    token
}

/// What an authenticator made of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A response was queued (or nothing was needed); wait for the next packet.
    Continue,
    Failed(String),
}

/// State an authenticator may read and update.
pub struct AuthContext<'a> {
    pub credentials: &'a Credentials,
    /// Last scramble received from the server. Auth switches replace it so
    /// later COM_CHANGE_USER packets are built with the right one.
    pub scramble: &'a mut [u8; SCRAMBLE_LEN],
    /// Bytes to send to the server.
    pub out: &'a mut Vec<u8>,
}

/// Backend side of an authentication plugin.
///
/// Called for every packet that is neither OK nor ERR while a backend
/// connection authenticates, and for such packets in reply to COM_CHANGE_USER.
pub trait BackendAuthenticator: Send {
    fn name(&self) -> &str;

    fn exchange(&mut self, packet: &Packet, ctx: &mut AuthContext<'_>) -> AuthOutcome;
}

/// `mysql_native_password`: answers auth switch requests to itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePasswordAuthenticator;

impl BackendAuthenticator for NativePasswordAuthenticator {
    fn name(&self) -> &str {
        DEFAULT_AUTH_PLUGIN
    }

    fn exchange(&mut self, packet: &Packet, ctx: &mut AuthContext<'_>) -> AuthOutcome {
        let Some(switch) = AuthSwitchRequest::parse(&packet.payload) else {
            return AuthOutcome::Failed(format!(
                "unexpected packet 0x{:02x} during authentication",
                packet.first_byte().unwrap_or(0)
            ));
        };
        if switch.plugin != DEFAULT_AUTH_PLUGIN {
            return AuthOutcome::Failed(format!(
                "server requested unsupported authentication plugin '{}'",
                switch.plugin
            ));
        }
        if switch.data.len() < SCRAMBLE_LEN {
            return AuthOutcome::Failed("auth switch request carries a short scramble".into());
        }
        ctx.scramble.copy_from_slice(&switch.data[..SCRAMBLE_LEN]);
        let token = ctx.credentials.token_for(ctx.scramble);
        protocol::write_packet(ctx.out, packet.seq.wrapping_add(1), &token);
        AuthOutcome::Continue
    }
}
