//! Process-wide access to the engine's entry points
//!
//! The host installs the engine's [`ApiTable`] exactly once with [`install`]. Every wrapper object
//! reaches the engine through the safe methods of [`Api`], which translate statuses into
//! [`Error`]s and never hold a lock of their own.

use std::{
    ffi::{c_void, CStr},
    ptr,
    sync::OnceLock,
};

use tracing::{debug, trace};

use crate::{
    error::Error,
    ffi::{
        ApiTable, ConnectionCallback, Handle, ListenerCallback, QuicBuffer, RawAddr,
        RawCredentialConfig, RawRegistrationConfig, RawSettings, StreamCallback,
    },
    status::Status,
};

static API: OnceLock<&'static ApiTable> = OnceLock::new();

/// Install the engine's entry points for this process
///
/// Installing the same table again is a no-op; installing a different one fails with
/// [`Error::InvalidState`], since objects opened through the first table would otherwise be
/// driven through the second.
pub fn install(table: &'static ApiTable) -> Result<(), Error> {
    let installed = API.get_or_init(|| {
        debug!("engine API table installed");
        table
    });
    match ptr::eq(*installed, table) {
        true => Ok(()),
        false => Err(Error::InvalidState),
    }
}

/// Whether [`install`] has been called
pub fn is_installed() -> bool {
    API.get().is_some()
}

pub(crate) fn api() -> Result<Api, Error> {
    API.get().map(|table| Api(table)).ok_or(Error::NotInitialized)
}

/// Length of a buffer in the engine's 32-bit length field
pub(crate) fn buffer_len(len: usize) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| Error::InvalidParameter)
}

/// Describe `data` to the engine without copying it
///
/// The descriptor must not outlive `data`; the engine only reads through it.
pub(crate) fn borrow_buffer(data: &[u8]) -> Result<QuicBuffer, Error> {
    Ok(QuicBuffer {
        length: buffer_len(data.len())?,
        buffer: data.as_ptr() as *mut u8,
    })
}

fn check(raw: u32) -> Result<(), Error> {
    Status(raw).to_result()
}

/// Safe front for the installed [`ApiTable`]
#[derive(Copy, Clone)]
pub(crate) struct Api(&'static ApiTable);

impl Api {
    pub(crate) fn set_listener_callback(
        self,
        handle: Handle,
        cb: ListenerCallback,
        ctx: *const c_void,
    ) {
        unsafe { (self.0.set_callback_handler)(handle, cb as *const c_void, ctx as *mut c_void) }
    }

    pub(crate) fn set_connection_callback(
        self,
        handle: Handle,
        cb: ConnectionCallback,
        ctx: *const c_void,
    ) {
        unsafe { (self.0.set_callback_handler)(handle, cb as *const c_void, ctx as *mut c_void) }
    }

    pub(crate) fn set_stream_callback(
        self,
        handle: Handle,
        cb: StreamCallback,
        ctx: *const c_void,
    ) {
        unsafe { (self.0.set_callback_handler)(handle, cb as *const c_void, ctx as *mut c_void) }
    }

    pub(crate) fn set_param(self, handle: Handle, param: u32, value: &[u8]) -> Result<(), Error> {
        let len = buffer_len(value.len())?;
        check(unsafe { (self.0.set_param)(handle, param, len, value.as_ptr().cast()) })
    }

    pub(crate) fn set_param_value<T: Copy>(
        self,
        handle: Handle,
        param: u32,
        value: &T,
    ) -> Result<(), Error> {
        let len = buffer_len(size_of::<T>())?;
        let value = value as *const T;
        check(unsafe { (self.0.set_param)(handle, param, len, value.cast()) })
    }

    /// Read a fixed-size parameter
    ///
    /// `T` must be a plain C value type for which any bit pattern the engine writes is valid.
    pub(crate) fn get_param_value<T: Copy + Default>(
        self,
        handle: Handle,
        param: u32,
    ) -> Result<T, Error> {
        let mut value = T::default();
        let mut len = buffer_len(size_of::<T>())?;
        let out = &mut value as *mut T;
        check(unsafe { (self.0.get_param)(handle, param, &mut len, out.cast()) })?;
        match len as usize == size_of::<T>() {
            true => Ok(value),
            false => Err(Error::InvalidParameter),
        }
    }

    pub(crate) fn registration_open(self, config: &RawRegistrationConfig) -> Result<Handle, Error> {
        let mut handle = Handle::NULL;
        check(unsafe { (self.0.registration_open)(config, &mut handle) })?;
        Ok(handle)
    }

    pub(crate) fn registration_close(self, handle: Handle) {
        trace!(?handle, "closing registration");
        unsafe { (self.0.registration_close)(handle) }
    }

    pub(crate) fn registration_shutdown(self, handle: Handle, flags: u32, code: u64) {
        unsafe { (self.0.registration_shutdown)(handle, flags, code) }
    }

    pub(crate) fn configuration_open(
        self,
        registration: Handle,
        alpns: &[QuicBuffer],
        settings: &RawSettings,
    ) -> Result<Handle, Error> {
        let count = buffer_len(alpns.len())?;
        let settings_len = buffer_len(size_of::<RawSettings>())?;
        let mut handle = Handle::NULL;
        check(unsafe {
            (self.0.configuration_open)(
                registration,
                alpns.as_ptr(),
                count,
                settings,
                settings_len,
                ptr::null_mut(),
                &mut handle,
            )
        })?;
        Ok(handle)
    }

    pub(crate) fn configuration_close(self, handle: Handle) {
        trace!(?handle, "closing configuration");
        unsafe { (self.0.configuration_close)(handle) }
    }

    pub(crate) fn configuration_load_credential(
        self,
        handle: Handle,
        credential: &RawCredentialConfig,
    ) -> Result<(), Error> {
        check(unsafe { (self.0.configuration_load_credential)(handle, credential) })
    }

    pub(crate) fn listener_open(
        self,
        registration: Handle,
        cb: ListenerCallback,
        ctx: *const c_void,
    ) -> Result<Handle, Error> {
        let mut handle = Handle::NULL;
        check(unsafe {
            (self.0.listener_open)(registration, cb, ctx as *mut c_void, &mut handle)
        })?;
        Ok(handle)
    }

    pub(crate) fn listener_close(self, handle: Handle) {
        trace!(?handle, "closing listener");
        unsafe { (self.0.listener_close)(handle) }
    }

    pub(crate) fn listener_start(
        self,
        handle: Handle,
        alpns: &[QuicBuffer],
        local: Option<&RawAddr>,
    ) -> Result<(), Error> {
        let count = buffer_len(alpns.len())?;
        let local = local.map_or(ptr::null(), |addr| addr as *const RawAddr);
        check(unsafe { (self.0.listener_start)(handle, alpns.as_ptr(), count, local) })
    }

    pub(crate) fn listener_stop(self, handle: Handle) {
        unsafe { (self.0.listener_stop)(handle) }
    }

    pub(crate) fn connection_open(
        self,
        registration: Handle,
        cb: ConnectionCallback,
        ctx: *const c_void,
    ) -> Result<Handle, Error> {
        let mut handle = Handle::NULL;
        check(unsafe {
            (self.0.connection_open)(registration, cb, ctx as *mut c_void, &mut handle)
        })?;
        Ok(handle)
    }

    pub(crate) fn connection_close(self, handle: Handle) {
        trace!(?handle, "closing connection");
        unsafe { (self.0.connection_close)(handle) }
    }

    pub(crate) fn connection_shutdown(self, handle: Handle, flags: u32, code: u64) {
        unsafe { (self.0.connection_shutdown)(handle, flags, code) }
    }

    pub(crate) fn connection_start(
        self,
        handle: Handle,
        configuration: Handle,
        family: u16,
        server_name: &CStr,
        port: u16,
    ) -> Result<(), Error> {
        check(unsafe {
            (self.0.connection_start)(handle, configuration, family, server_name.as_ptr(), port)
        })
    }

    pub(crate) fn connection_set_configuration(
        self,
        handle: Handle,
        configuration: Handle,
    ) -> Result<(), Error> {
        check(unsafe { (self.0.connection_set_configuration)(handle, configuration) })
    }

    pub(crate) fn connection_send_resumption_ticket(
        self,
        handle: Handle,
        flags: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        let len = u16::try_from(data.len()).map_err(|_| Error::InvalidParameter)?;
        let data = match data.is_empty() {
            true => ptr::null(),
            false => data.as_ptr(),
        };
        check(unsafe { (self.0.connection_send_resumption_ticket)(handle, flags, len, data) })
    }

    pub(crate) fn connection_certificate_validation_complete(
        self,
        handle: Handle,
        accept: bool,
        alert: u16,
    ) -> Result<(), Error> {
        check(unsafe {
            (self.0.connection_certificate_validation_complete)(handle, accept as u8, alert)
        })
    }

    pub(crate) fn stream_open(
        self,
        connection: Handle,
        flags: u32,
        cb: StreamCallback,
        ctx: *const c_void,
    ) -> Result<Handle, Error> {
        let mut handle = Handle::NULL;
        check(unsafe {
            (self.0.stream_open)(connection, flags, cb, ctx as *mut c_void, &mut handle)
        })?;
        Ok(handle)
    }

    pub(crate) fn stream_close(self, handle: Handle) {
        trace!(?handle, "closing stream");
        unsafe { (self.0.stream_close)(handle) }
    }

    pub(crate) fn stream_start(self, handle: Handle, flags: u32) -> Result<(), Error> {
        check(unsafe { (self.0.stream_start)(handle, flags) })
    }

    pub(crate) fn stream_shutdown(
        self,
        handle: Handle,
        flags: u32,
        code: u64,
    ) -> Result<(), Error> {
        check(unsafe { (self.0.stream_shutdown)(handle, flags, code) })
    }

    /// Submit one buffer for sending
    ///
    /// # Safety
    ///
    /// `buffer` and the memory it describes must stay valid until the engine reports the send
    /// complete for `ctx`, or until this call returns an error.
    pub(crate) unsafe fn stream_send(
        self,
        handle: Handle,
        buffer: *const QuicBuffer,
        flags: u32,
        ctx: *mut c_void,
    ) -> Result<(), Error> {
        check(unsafe { (self.0.stream_send)(handle, buffer, 1, flags, ctx) })
    }

    pub(crate) fn stream_receive_complete(self, handle: Handle, len: u64) {
        unsafe { (self.0.stream_receive_complete)(handle, len) }
    }

    /// Submit one datagram
    ///
    /// # Safety
    ///
    /// As for [`Api::stream_send`], with the datagram's final send state in place of the send
    /// complete event.
    pub(crate) unsafe fn datagram_send(
        self,
        handle: Handle,
        buffer: *const QuicBuffer,
        flags: u32,
        ctx: *mut c_void,
    ) -> Result<(), Error> {
        check(unsafe { (self.0.datagram_send)(handle, buffer, 1, flags, ctx) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_bounds() {
        assert_eq!(buffer_len(0), Ok(0));
        assert_eq!(buffer_len(u32::MAX as usize), Ok(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(buffer_len(u32::MAX as usize + 1), Err(Error::InvalidParameter));
    }

    #[test]
    fn borrowed_descriptor() {
        let data = b"Hello";
        let buf = borrow_buffer(data).unwrap();
        assert_eq!(buf.length, 5);
        assert_eq!(unsafe { buf.as_slice() }, data);
    }
}
