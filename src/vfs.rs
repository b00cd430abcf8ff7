//! SQLite VFS shim serving page reads from the pinned remote object
//!
//! The engine's file I/O surface is a C ABI: a process-global `sqlite3_vfs`
//! registration whose `xOpen` hands out `sqlite3_file` handles backed by
//! `sqlite3_io_methods` callbacks. Each session registers its own VFS under
//! a unique name carrying the session's [`SnapshotIo`] as app data, so
//! concurrent sessions never observe each other.
//!
//! The engine only understands integer result codes, so read failures are
//! recorded on a side channel ([`SnapshotIo::take_error`]) and collapsed to
//! `SQLITE_IOERR_READ`; the API boundary re-attaches the recorded error.
//! Callbacks never unwind across the boundary.

use crate::error::Error;
use crate::reader::ObjectReader;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::ffi;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Reported to the engine as the device sector size.
const SECTOR_SIZE: c_int = 4096;

/// Per-session I/O state shared between the [`crate::session::Session`] and
/// the registered VFS.
pub(crate) struct SnapshotIo {
    reader: ObjectReader,
    size: u64,
    last_error: Mutex<Option<Error>>,
}

impl SnapshotIo {
    pub fn new(reader: ObjectReader, size: u64) -> Self {
        Self {
            reader,
            size,
            last_error: Mutex::new(None),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill as much of `out` as the pinned object covers, starting at
    /// `offset`. Returns the number of bytes written; the engine zero-fills
    /// the remainder on a short read.
    fn read_at(&self, offset: u64, out: &mut [u8]) -> Result<usize, Error> {
        if offset >= self.size {
            return Ok(0);
        }
        let available = ((self.size - offset).min(out.len() as u64)) as usize;
        self.reader.read_into(offset, &mut out[..available])?;
        Ok(available)
    }

    fn record_error(&self, err: Error) {
        *self.last_error.lock() = Some(err);
    }

    /// Take the error behind the engine's last disk-I/O code, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.last_error.lock().take()
    }
}

/// File handle layout the engine sees. The base must be the first field so
/// `sqlite3_file` pointers can be cast back.
#[repr(C)]
struct SnapshotFile {
    base: ffi::sqlite3_file,
    io: *const SnapshotIo,
}

/// A registered VFS. Unregisters and reclaims its allocations on drop; the
/// session keeps it alive until the database handle is closed.
pub(crate) struct VfsHandle {
    vfs: *mut ffi::sqlite3_vfs,
    name: String,
    _c_name: CString,
}

impl VfsHandle {
    /// Register a fresh VFS under a unique name, owning one reference to
    /// `io`.
    pub fn register(io: Arc<SnapshotIo>) -> Result<Self, Error> {
        let name = format!("s3qlite-{}", Uuid::new_v4().simple());
        let c_name = CString::new(name.clone())
            .map_err(|_| Error::Vfs("VFS name contains NUL".to_string()))?;

        let vfs = Box::into_raw(Box::new(ffi::sqlite3_vfs {
            iVersion: 2,
            szOsFile: std::mem::size_of::<SnapshotFile>() as c_int,
            mxPathname: 512,
            pNext: ptr::null_mut(),
            zName: c_name.as_ptr(),
            pAppData: Arc::into_raw(io) as *mut c_void,
            xOpen: Some(x_open),
            xDelete: Some(x_delete),
            xAccess: Some(x_access),
            xFullPathname: Some(x_full_pathname),
            xDlOpen: None,
            xDlError: None,
            xDlSym: None,
            xDlClose: None,
            xRandomness: Some(x_randomness),
            xSleep: Some(x_sleep),
            xCurrentTime: Some(x_current_time),
            xGetLastError: None,
            xCurrentTimeInt64: Some(x_current_time_int64),
            xSetSystemCall: None,
            xGetSystemCall: None,
            xNextSystemCall: None,
        }));

        let rc = unsafe { ffi::sqlite3_vfs_register(vfs, 0) };
        if rc != ffi::SQLITE_OK {
            unsafe {
                let vfs = Box::from_raw(vfs);
                drop(Arc::from_raw(vfs.pAppData as *const SnapshotIo));
            }
            return Err(Error::Vfs(format!(
                "sqlite3_vfs_register returned {rc}"
            )));
        }
        Ok(Self {
            vfs,
            name,
            _c_name: c_name,
        })
    }

    /// The unique name the engine resolves this VFS under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for VfsHandle {
    fn drop(&mut self) {
        unsafe {
            ffi::sqlite3_vfs_unregister(self.vfs);
            let vfs = Box::from_raw(self.vfs);
            drop(Arc::from_raw(vfs.pAppData as *const SnapshotIo));
        }
    }
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

/// Run a callback body, turning a panic into `fail` rather than unwinding
/// across the C boundary.
fn guard<T>(fail: T, body: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(body)).unwrap_or(fail)
}

unsafe extern "C" fn x_open(
    vfs: *mut ffi::sqlite3_vfs,
    _name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    out_flags: *mut c_int,
) -> c_int {
    guard(ffi::SQLITE_CANTOPEN, || {
        // Only the main database can exist remotely. The engine never asks
        // for journals or WAL files because the device reports itself
        // immutable.
        if flags & ffi::SQLITE_OPEN_MAIN_DB == 0 {
            return ffi::SQLITE_CANTOPEN;
        }
        let file = file as *mut SnapshotFile;
        unsafe {
            (*file).base.pMethods = &IO_METHODS;
            (*file).io = (*vfs).pAppData as *const SnapshotIo;
            if !out_flags.is_null() {
                *out_flags = ffi::SQLITE_OPEN_READONLY;
            }
        }
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_close(_file: *mut ffi::sqlite3_file) -> c_int {
    // The HTTP connection is owned by the session, not the file handle.
    guard(ffi::SQLITE_IOERR_CLOSE, || ffi::SQLITE_OK)
}

unsafe extern "C" fn x_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    guard(ffi::SQLITE_IOERR_READ, || {
        if amt <= 0 || offset < 0 {
            return ffi::SQLITE_IOERR_READ;
        }
        let file = unsafe { &*(file as *mut SnapshotFile) };
        let io = unsafe { &*file.io };
        let out = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize) };
        match io.read_at(offset as u64, &mut *out) {
            Ok(n) if n == out.len() => ffi::SQLITE_OK,
            Ok(n) => {
                out[n..].fill(0);
                ffi::SQLITE_IOERR_SHORT_READ
            }
            Err(err) => {
                warn!(error = %err, offset, amt, "remote read failed");
                io.record_error(err);
                ffi::SQLITE_IOERR_READ
            }
        }
    })
}

unsafe extern "C" fn x_write(
    _file: *mut ffi::sqlite3_file,
    _buf: *const c_void,
    _amt: c_int,
    _offset: ffi::sqlite3_int64,
) -> c_int {
    guard(ffi::SQLITE_READONLY, || ffi::SQLITE_READONLY)
}

unsafe extern "C" fn x_truncate(_file: *mut ffi::sqlite3_file, _size: ffi::sqlite3_int64) -> c_int {
    guard(ffi::SQLITE_READONLY, || ffi::SQLITE_READONLY)
}

unsafe extern "C" fn x_sync(_file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    guard(ffi::SQLITE_READONLY, || ffi::SQLITE_READONLY)
}

unsafe extern "C" fn x_file_size(
    file: *mut ffi::sqlite3_file,
    size: *mut ffi::sqlite3_int64,
) -> c_int {
    guard(ffi::SQLITE_IOERR_FSTAT, || {
        let file = unsafe { &*(file as *mut SnapshotFile) };
        let io = unsafe { &*file.io };
        unsafe { *size = io.size() as ffi::sqlite3_int64 };
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_lock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    guard(ffi::SQLITE_IOERR_LOCK, || ffi::SQLITE_OK)
}

unsafe extern "C" fn x_unlock(_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    guard(ffi::SQLITE_IOERR_UNLOCK, || ffi::SQLITE_OK)
}

unsafe extern "C" fn x_check_reserved_lock(
    _file: *mut ffi::sqlite3_file,
    out: *mut c_int,
) -> c_int {
    guard(ffi::SQLITE_IOERR_CHECKRESERVEDLOCK, || {
        unsafe { *out = 0 };
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_file_control(
    _file: *mut ffi::sqlite3_file,
    _op: c_int,
    _arg: *mut c_void,
) -> c_int {
    guard(ffi::SQLITE_NOTFOUND, || ffi::SQLITE_NOTFOUND)
}

unsafe extern "C" fn x_sector_size(_file: *mut ffi::sqlite3_file) -> c_int {
    guard(SECTOR_SIZE, || SECTOR_SIZE)
}

unsafe extern "C" fn x_device_characteristics(_file: *mut ffi::sqlite3_file) -> c_int {
    // The pinned version never changes; the engine skips locking and change
    // detection entirely.
    guard(ffi::SQLITE_IOCAP_IMMUTABLE, || ffi::SQLITE_IOCAP_IMMUTABLE)
}

unsafe extern "C" fn x_delete(
    _vfs: *mut ffi::sqlite3_vfs,
    _name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    guard(ffi::SQLITE_IOERR_DELETE, || ffi::SQLITE_IOERR_DELETE)
}

unsafe extern "C" fn x_access(
    _vfs: *mut ffi::sqlite3_vfs,
    _name: *const c_char,
    _flags: c_int,
    out: *mut c_int,
) -> c_int {
    guard(ffi::SQLITE_IOERR_ACCESS, || {
        // No journal, WAL, or sidecar files exist next to the remote
        // object.
        unsafe { *out = 0 };
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    name: *const c_char,
    n_out: c_int,
    out: *mut c_char,
) -> c_int {
    guard(ffi::SQLITE_CANTOPEN, || {
        if name.is_null() || out.is_null() || n_out <= 0 {
            return ffi::SQLITE_CANTOPEN;
        }
        let input = unsafe { std::ffi::CStr::from_ptr(name) }.to_bytes();
        let len = input.len().min(n_out as usize - 1);
        unsafe {
            ptr::copy_nonoverlapping(input.as_ptr() as *const c_char, out, len);
            *out.add(len) = 0;
        }
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_randomness(
    _vfs: *mut ffi::sqlite3_vfs,
    n: c_int,
    out: *mut c_char,
) -> c_int {
    guard(0, || {
        if n <= 0 || out.is_null() {
            return 0;
        }
        let buf = unsafe { std::slice::from_raw_parts_mut(out as *mut u8, n as usize) };
        rand::thread_rng().fill_bytes(buf);
        n
    })
}

unsafe extern "C" fn x_sleep(_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    guard(0, || {
        std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
        microseconds
    })
}

/// Milliseconds between the julian-day epoch and the Unix epoch.
const JULIAN_UNIX_EPOCH_MS: i64 = 210_866_760_000_000;

unsafe extern "C" fn x_current_time(_vfs: *mut ffi::sqlite3_vfs, out: *mut f64) -> c_int {
    guard(ffi::SQLITE_ERROR, || {
        let unix_ms = chrono::Utc::now().timestamp_millis();
        unsafe { *out = (JULIAN_UNIX_EPOCH_MS + unix_ms) as f64 / 86_400_000.0 };
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_current_time_int64(
    _vfs: *mut ffi::sqlite3_vfs,
    out: *mut ffi::sqlite3_int64,
) -> c_int {
    guard(ffi::SQLITE_ERROR, || {
        unsafe { *out = JULIAN_UNIX_EPOCH_MS + chrono::Utc::now().timestamp_millis() };
        ffi::SQLITE_OK
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpClient, HttpResponse};
    use crate::types::{Credentials, ObjectUrl};
    use std::ffi::CString;

    struct Unreachable;

    impl HttpClient for Unreachable {
        fn get(&self, _url: &str, _headers: &[(String, String)]) -> Result<HttpResponse, Error> {
            Err(Error::network(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "test client",
            )))
        }
    }

    fn dummy_io() -> Arc<SnapshotIo> {
        let reader = ObjectReader::new(
            Box::new(Unreachable),
            ObjectUrl::parse("http://localhost:9000/b/k.db").unwrap(),
            Box::new(Credentials::new("us-east-1", "AKID", "secret", None)),
            "v1".to_string(),
        );
        Arc::new(SnapshotIo::new(reader, 4096))
    }

    #[test]
    fn test_register_makes_vfs_findable_until_drop() {
        let handle = VfsHandle::register(dummy_io()).unwrap();
        let c_name = CString::new(handle.name()).unwrap();
        let found = unsafe { ffi::sqlite3_vfs_find(c_name.as_ptr()) };
        assert!(!found.is_null());
        drop(handle);
        let found = unsafe { ffi::sqlite3_vfs_find(c_name.as_ptr()) };
        assert!(found.is_null());
    }

    #[test]
    fn test_register_twice_yields_distinct_names() {
        let a = VfsHandle::register(dummy_io()).unwrap();
        let b = VfsHandle::register(dummy_io()).unwrap();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_read_failure_is_recorded_on_side_channel() {
        let io = dummy_io();
        let mut out = [0u8; 16];
        assert!(io.read_at(0, &mut out).is_err());
        // read_at propagates; the callback records. Simulate the callback
        // path directly.
        let err = io.read_at(0, &mut out).unwrap_err();
        io.record_error(err);
        assert!(matches!(io.take_error(), Some(Error::Network(_))));
        assert!(io.take_error().is_none());
    }

    #[test]
    fn test_reads_past_object_size_are_clamped() {
        let io = dummy_io();
        let mut out = [0u8; 16];
        // Entirely past the end: nothing to fetch, engine zero-fills.
        assert_eq!(io.read_at(10_000, &mut out).unwrap(), 0);
    }
}
