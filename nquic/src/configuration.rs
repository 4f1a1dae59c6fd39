use std::{
    ffi::CString,
    fmt,
    path::{Path, PathBuf},
    ptr,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    api::{api, borrow_buffer},
    error::Error,
    ffi::{self, settings_mask, Handle, QuicBuffer, RawCredentialConfig, RawSettings},
    flags::CredentialFlags,
    registration::Registration,
    window::DEFAULT_BOOTSTRAP_WINDOW,
};

/// Whether a server lets clients resume sessions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServerResumptionLevel {
    NoResume,
    ResumeOnly,
    /// Also accept 0-RTT data on resumed sessions
    ResumeAndZeroRtt,
}

/// Connection settings applied through a [`Configuration`]
///
/// Anything left unset keeps the engine's default.
#[derive(Debug, Clone)]
pub struct Settings {
    idle_timeout: Option<Duration>,
    handshake_idle_timeout: Option<Duration>,
    keep_alive_interval: Option<Duration>,
    peer_bidi_stream_count: Option<u16>,
    peer_unidi_stream_count: Option<u16>,
    datagram_receive_enabled: Option<bool>,
    send_buffering_enabled: Option<bool>,
    server_resumption_level: Option<ServerResumptionLevel>,
    send_window_bootstrap: u64,
}

impl Settings {
    /// Maximum duration of inactivity before the connection is closed
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = Some(value);
        self
    }

    /// Maximum duration of inactivity during the handshake
    pub fn handshake_idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.handshake_idle_timeout = Some(value);
        self
    }

    /// Period of inactivity before sending a keep-alive packet
    pub fn keep_alive_interval(&mut self, value: Duration) -> &mut Self {
        self.keep_alive_interval = Some(value);
        self
    }

    /// Number of bidirectional streams the peer may open concurrently
    ///
    /// Must be nonzero for the peer to open any bidirectional streams.
    pub fn peer_bidi_stream_count(&mut self, value: u16) -> &mut Self {
        self.peer_bidi_stream_count = Some(value);
        self
    }

    /// Variant of `peer_bidi_stream_count` affecting unidirectional streams
    pub fn peer_unidi_stream_count(&mut self, value: u16) -> &mut Self {
        self.peer_unidi_stream_count = Some(value);
        self
    }

    pub fn datagram_receive_enabled(&mut self, value: bool) -> &mut Self {
        self.datagram_receive_enabled = Some(value);
        self
    }

    /// Whether the engine copies and buffers stream data handed to it
    ///
    /// Must be explicitly disabled for [`Stream::send_chunks`](crate::Stream::send_chunks) and
    /// [`Stream::enqueue`](crate::Stream::enqueue).
    pub fn send_buffering_enabled(&mut self, value: bool) -> &mut Self {
        self.send_buffering_enabled = Some(value);
        self
    }

    pub fn server_resumption_level(&mut self, value: ServerResumptionLevel) -> &mut Self {
        self.server_resumption_level = Some(value);
        self
    }

    /// Bytes a windowed send may have in flight before the engine reports an ideal send buffer
    /// size
    ///
    /// Tuning only; this is not a protocol limit. Defaults to 64 KiB.
    pub fn send_window_bootstrap(&mut self, value: u64) -> &mut Self {
        self.send_window_bootstrap = value;
        self
    }

    /// The bootstrap window, if windowed sends are allowed
    pub(crate) fn windowed_send_bootstrap(&self) -> Option<u64> {
        match self.send_buffering_enabled {
            Some(false) => Some(self.send_window_bootstrap),
            _ => None,
        }
    }

    pub(crate) fn to_raw(&self) -> RawSettings {
        let mut raw = RawSettings::default();
        if let Some(value) = self.idle_timeout {
            raw.is_set |= settings_mask::IDLE_TIMEOUT;
            raw.idle_timeout_ms = millis(value);
        }
        if let Some(value) = self.handshake_idle_timeout {
            raw.is_set |= settings_mask::HANDSHAKE_IDLE_TIMEOUT;
            raw.handshake_idle_timeout_ms = millis(value);
        }
        if let Some(value) = self.keep_alive_interval {
            raw.is_set |= settings_mask::KEEP_ALIVE_INTERVAL;
            raw.keep_alive_interval_ms = u32::try_from(millis(value)).unwrap_or(u32::MAX);
        }
        if let Some(value) = self.peer_bidi_stream_count {
            raw.is_set |= settings_mask::PEER_BIDI_STREAM_COUNT;
            raw.peer_bidi_stream_count = value;
        }
        if let Some(value) = self.peer_unidi_stream_count {
            raw.is_set |= settings_mask::PEER_UNIDI_STREAM_COUNT;
            raw.peer_unidi_stream_count = value;
        }
        if let Some(value) = self.datagram_receive_enabled {
            raw.is_set |= settings_mask::DATAGRAM_RECEIVE_ENABLED;
            raw.datagram_receive_enabled = value as u8;
        }
        if let Some(value) = self.send_buffering_enabled {
            raw.is_set |= settings_mask::SEND_BUFFERING_ENABLED;
            raw.send_buffering_enabled = value as u8;
        }
        if let Some(value) = self.server_resumption_level {
            raw.is_set |= settings_mask::SERVER_RESUMPTION_LEVEL;
            raw.server_resumption_level = match value {
                ServerResumptionLevel::NoResume => 0,
                ServerResumptionLevel::ResumeOnly => 1,
                ServerResumptionLevel::ResumeAndZeroRtt => 2,
            };
        }
        raw
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            handshake_idle_timeout: None,
            keep_alive_interval: None,
            peer_bidi_stream_count: None,
            peer_unidi_stream_count: None,
            datagram_receive_enabled: None,
            send_buffering_enabled: None,
            server_resumption_level: None,
            send_window_bootstrap: DEFAULT_BOOTSTRAP_WINDOW,
        }
    }
}

fn millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// TLS credential material, loaded by the engine
#[derive(Clone)]
pub enum Credential {
    /// No certificate, as used by most clients
    None,
    CertificateFile {
        certificate: PathBuf,
        private_key: PathBuf,
    },
    /// A certificate whose private key file is encrypted with `password`
    CertificateFileProtected {
        certificate: PathBuf,
        private_key: PathBuf,
        password: String,
    },
    /// A DER encoded PKCS #12 archive
    Pkcs12 { der: Bytes, password: Option<String> },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::CertificateFile {
                certificate,
                private_key,
            }
            | Self::CertificateFileProtected {
                certificate,
                private_key,
                ..
            } => f
                .debug_struct("CertificateFile")
                .field("certificate", certificate)
                .field("private_key", private_key)
                .finish_non_exhaustive(),
            Self::Pkcs12 { der, .. } => f
                .debug_struct("Pkcs12")
                .field("len", &der.len())
                .finish_non_exhaustive(),
        }
    }
}

/// C strings backing a [`RawCredentialConfig`] while it is handed to the engine
struct CredentialStrings {
    certificate: Option<CString>,
    private_key: Option<CString>,
    password: Option<CString>,
}

fn path_cstring(path: &Path) -> Result<CString, Error> {
    let path = path.to_str().ok_or(Error::InvalidParameter)?;
    CString::new(path).map_err(|_| Error::InvalidParameter)
}

fn password_cstring(password: &str) -> Result<CString, Error> {
    CString::new(password).map_err(|_| Error::InvalidParameter)
}

impl CredentialStrings {
    fn new(credential: &Credential) -> Result<Self, Error> {
        let mut strings = Self {
            certificate: None,
            private_key: None,
            password: None,
        };
        match credential {
            Credential::None => {}
            Credential::CertificateFile {
                certificate,
                private_key,
            } => {
                strings.certificate = Some(path_cstring(certificate)?);
                strings.private_key = Some(path_cstring(private_key)?);
            }
            Credential::CertificateFileProtected {
                certificate,
                private_key,
                password,
            } => {
                strings.certificate = Some(path_cstring(certificate)?);
                strings.private_key = Some(path_cstring(private_key)?);
                strings.password = Some(password_cstring(password)?);
            }
            Credential::Pkcs12 { password, .. } => {
                strings.password = password.as_deref().map(password_cstring).transpose()?;
            }
        }
        Ok(strings)
    }

    fn raw(
        &self,
        credential: &Credential,
        flags: CredentialFlags,
    ) -> Result<RawCredentialConfig, Error> {
        fn ptr_of(s: &Option<CString>) -> *const std::ffi::c_char {
            s.as_ref().map_or(ptr::null(), |s| s.as_ptr())
        }
        let (kind, pkcs12, pkcs12_length) = match credential {
            Credential::None => (ffi::CREDENTIAL_TYPE_NONE, ptr::null(), 0),
            Credential::CertificateFile { .. } => {
                (ffi::CREDENTIAL_TYPE_CERTIFICATE_FILE, ptr::null(), 0)
            }
            Credential::CertificateFileProtected { .. } => {
                (ffi::CREDENTIAL_TYPE_CERTIFICATE_FILE_PROTECTED, ptr::null(), 0)
            }
            Credential::Pkcs12 { der, .. } => {
                let buf = borrow_buffer(der)?;
                (ffi::CREDENTIAL_TYPE_PKCS12, der.as_ptr(), buf.length)
            }
        };
        Ok(RawCredentialConfig {
            kind,
            flags: flags.bits(),
            certificate_file: ptr_of(&self.certificate),
            private_key_file: ptr_of(&self.private_key),
            password: ptr_of(&self.password),
            pkcs12,
            pkcs12_length,
        })
    }
}

/// ALPN, settings and credentials for connections and listeners
///
/// Cloning is cheap; the native configuration is closed when the last clone and the last
/// connection started with it are gone.
#[derive(Clone)]
pub struct Configuration(Arc<ConfigurationInner>);

struct ConfigurationInner {
    handle: Handle,
    alpns: Vec<Bytes>,
    settings: Settings,
    _registration: Registration,
}

impl Configuration {
    /// Open a configuration offering `alpns`, in order of preference
    ///
    /// Each protocol id must be 1 to 255 bytes long and at least one is required.
    pub fn new<A: AsRef<[u8]>>(
        registration: &Registration,
        alpns: &[A],
        settings: Settings,
    ) -> Result<Self, Error> {
        let api = api()?;
        let alpns = alpn_list(alpns)?;
        let buffers = alpn_buffers(&alpns)?;
        let handle = api.configuration_open(registration.handle(), &buffers, &settings.to_raw())?;
        debug!(?handle, ?settings, "configuration opened");
        Ok(Self(Arc::new(ConfigurationInner {
            handle,
            alpns,
            settings,
            _registration: registration.clone(),
        })))
    }

    /// Load the TLS credential connections started or accepted with this configuration use
    pub fn load_credential(
        &self,
        credential: &Credential,
        flags: CredentialFlags,
    ) -> Result<(), Error> {
        let api = api()?;
        let strings = CredentialStrings::new(credential)?;
        let raw = strings.raw(credential, flags)?;
        api.configuration_load_credential(self.0.handle, &raw)
    }

    pub fn settings(&self) -> &Settings {
        &self.0.settings
    }

    pub fn alpns(&self) -> &[Bytes] {
        &self.0.alpns
    }

    pub(crate) fn handle(&self) -> Handle {
        self.0.handle
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("handle", &self.0.handle)
            .field("alpns", &self.0.alpns)
            .finish_non_exhaustive()
    }
}

impl Drop for ConfigurationInner {
    fn drop(&mut self) {
        if let Ok(api) = api() {
            api.configuration_close(self.handle);
        }
    }
}

/// Copy and validate a list of protocol ids
pub(crate) fn alpn_list<A: AsRef<[u8]>>(alpns: &[A]) -> Result<Vec<Bytes>, Error> {
    if alpns.is_empty() {
        return Err(Error::InvalidParameter);
    }
    alpns
        .iter()
        .map(|alpn| match alpn.as_ref().len() {
            1..=255 => Ok(Bytes::copy_from_slice(alpn.as_ref())),
            _ => Err(Error::InvalidParameter),
        })
        .collect()
}

/// Descriptors for `alpns`, valid while `alpns` is
pub(crate) fn alpn_buffers(alpns: &[Bytes]) -> Result<Vec<QuicBuffer>, Error> {
    alpns.iter().map(|alpn| borrow_buffer(alpn)).collect()
}
