use std::{ffi::CString, fmt, sync::Arc};

use tracing::debug;

use crate::{
    api::api,
    error::Error,
    ffi::{Handle, RawRegistrationConfig},
    flags::ConnectionShutdownFlags,
};

/// How the engine schedules work for a registration's connections
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ExecutionProfile {
    #[default]
    LowLatency,
    MaxThroughput,
    /// Yield to all other work
    Scavenger,
    RealTime,
}

impl ExecutionProfile {
    fn to_raw(self) -> u32 {
        match self {
            Self::LowLatency => 0,
            Self::MaxThroughput => 1,
            Self::Scavenger => 2,
            Self::RealTime => 3,
        }
    }
}

/// An application's registration with the engine
///
/// Every configuration, listener and connection belongs to one registration and keeps it open;
/// the native registration is closed after the last of them and the last clone are gone.
#[derive(Clone)]
pub struct Registration(Arc<RegistrationInner>);

struct RegistrationInner {
    handle: Handle,
    app_name: CString,
}

impl Registration {
    pub fn new(app_name: &str, profile: ExecutionProfile) -> Result<Self, Error> {
        let api = api()?;
        let app_name = CString::new(app_name).map_err(|_| Error::InvalidParameter)?;
        let config = RawRegistrationConfig {
            app_name: app_name.as_ptr(),
            execution_profile: profile.to_raw(),
        };
        let handle = api.registration_open(&config)?;
        debug!(?handle, app = ?app_name, ?profile, "registration opened");
        Ok(Self(Arc::new(RegistrationInner { handle, app_name })))
    }

    /// Shut down every connection of this registration
    pub fn shutdown(&self, flags: ConnectionShutdownFlags, error_code: u64) -> Result<(), Error> {
        api()?.registration_shutdown(self.0.handle, flags.bits(), error_code);
        Ok(())
    }

    pub(crate) fn handle(&self) -> Handle {
        self.0.handle
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.0.handle)
            .field("app_name", &self.0.app_name)
            .finish()
    }
}

impl Drop for RegistrationInner {
    fn drop(&mut self) {
        if let Ok(api) = api() {
            api.registration_close(self.handle);
        }
    }
}
