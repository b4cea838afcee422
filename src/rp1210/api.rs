//! Thin wrapper over the symbols an RP1210 vendor library exports.
//!
//! The RP1210 API is a small set of C functions every vendor DLL provides under fixed
//! names. Symbols are looked up per call rather than cached, which sidesteps holding
//! borrowed [`libloading::Symbol`]s alongside their [`Library`].

use std::ffi::c_char;

use libloading::Library;

use crate::rp1210::error::Error;

type ClientConnectFn = unsafe extern "system" fn(
    hwnd_client: usize,
    device_id: i16,
    connection_string: *const c_char,
    send_buffer_size: i32,
    receive_buffer_size: i32,
    is_app_packetizing: i16,
) -> i16;
type ClientDisconnectFn = unsafe extern "system" fn(client_id: i16) -> i16;
type SendMessageFn = unsafe extern "system" fn(
    client_id: i16,
    message: *const c_char,
    message_size: i16,
    notify_status_on_tx: i16,
    block_on_send: i16,
) -> i16;
type ReadMessageFn = unsafe extern "system" fn(
    client_id: i16,
    buffer: *mut c_char,
    buffer_size: i16,
    block_on_read: i16,
) -> i16;
type SendCommandFn = unsafe extern "system" fn(
    command: i16,
    client_id: i16,
    command_data: *const c_char,
    command_size: i16,
) -> i16;
type ReadVersionFn = unsafe extern "system" fn(
    dll_major: *mut c_char,
    dll_minor: *mut c_char,
    api_major: *mut c_char,
    api_minor: *mut c_char,
);

/// Loaded vendor library. One instance per connected client.
pub struct Rp1210Api {
    library: Library,
}

impl Rp1210Api {
    pub fn load(library_path: &str) -> Result<Self, Error> {
        let library = unsafe { Library::new(library_path) }
            .map_err(|e| Error::Library(format!("{}: {}", library_path, e)))?;
        Ok(Self { library })
    }

    fn symbol<T>(&self, name: &[u8]) -> Result<libloading::Symbol<'_, T>, Error> {
        unsafe { self.library.get(name) }.map_err(|e| Error::Library(e.to_string()))
    }

    /// Returns the client id on success. Client ids are 0..=127, values of 128 and above
    /// are error codes.
    pub fn client_connect(
        &self,
        device_id: i16,
        connection_string: &str,
    ) -> Result<i16, Error> {
        let connection = std::ffi::CString::new(connection_string)
            .map_err(|_| Error::Library("connection string contains NUL".into()))?;
        let connect: libloading::Symbol<ClientConnectFn> = self.symbol(b"RP1210_ClientConnect\0")?;

        let ret = unsafe { connect(0, device_id, connection.as_ptr(), 0, 0, 0) };
        match ret {
            0..=127 => Ok(ret),
            code => Err(Error::Api(code)),
        }
    }

    pub fn client_disconnect(&self, client_id: i16) -> Result<(), Error> {
        let disconnect: libloading::Symbol<ClientDisconnectFn> =
            self.symbol(b"RP1210_ClientDisconnect\0")?;
        match unsafe { disconnect(client_id) } {
            0 => Ok(()),
            code => Err(Error::Api(code)),
        }
    }

    pub fn send_message(&self, client_id: i16, message: &[u8]) -> Result<(), Error> {
        let send: libloading::Symbol<SendMessageFn> = self.symbol(b"RP1210_SendMessage\0")?;
        let ret = unsafe {
            send(
                client_id,
                message.as_ptr() as *const c_char,
                message.len() as i16,
                0,
                0, // non-blocking
            )
        };
        match ret {
            0 => Ok(()),
            code => Err(Error::Api(code)),
        }
    }

    /// Non-blocking read. `Ok(None)` when the receive queue is empty.
    pub fn read_message(&self, client_id: i16) -> Result<Option<Vec<u8>>, Error> {
        let mut buffer = [0u8; 2048];
        let read: libloading::Symbol<ReadMessageFn> = self.symbol(b"RP1210_ReadMessage\0")?;
        let ret = unsafe {
            read(
                client_id,
                buffer.as_mut_ptr() as *mut c_char,
                buffer.len() as i16,
                0, // non-blocking
            )
        };
        match ret {
            0 => Ok(None),
            n if n > 0 => Ok(Some(buffer[..n as usize].to_vec())),
            // Negative return is the negated error code
            n => Err(Error::Api(-n)),
        }
    }

    /// DLL and API version as "dll <maj>.<min> api <maj>.<min>".
    pub fn read_version(&self) -> Result<String, Error> {
        let read: libloading::Symbol<ReadVersionFn> = self.symbol(b"RP1210_ReadVersion\0")?;
        let mut buffers = [[0u8; 17]; 4];
        unsafe {
            let [a, b, c, d] = &mut buffers;
            read(
                a.as_mut_ptr() as *mut c_char,
                b.as_mut_ptr() as *mut c_char,
                c.as_mut_ptr() as *mut c_char,
                d.as_mut_ptr() as *mut c_char,
            );
        }

        let field = |buf: &[u8]| -> String {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..end]).into_owned()
        };
        Ok(format!(
            "dll {}.{} api {}.{}",
            field(&buffers[0]),
            field(&buffers[1]),
            field(&buffers[2]),
            field(&buffers[3])
        ))
    }

    pub fn send_command(&self, command: i16, client_id: i16, data: &[u8]) -> Result<(), Error> {
        let send: libloading::Symbol<SendCommandFn> = self.symbol(b"RP1210_SendCommand\0")?;
        let ret = unsafe {
            send(
                command,
                client_id,
                data.as_ptr() as *const c_char,
                data.len() as i16,
            )
        };
        match ret {
            0 => Ok(()),
            code => Err(Error::Api(code)),
        }
    }
}
