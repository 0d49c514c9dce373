//! Owned handles over the DuckDB C API.
//!
//! Queries run on raw connections so another thread can interrupt them and
//! so one call may carry several statements. Arrow results come back
//! through the C data interface, the same way the `duckdb` crate reads them.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::Arc;

use arrow::array::StructArray;
use arrow::datatypes::{Schema, SchemaRef};
use arrow::ffi::{from_ffi, FFI_ArrowArray, FFI_ArrowSchema};
use arrow::record_batch::RecordBatch;
use duckdb::{ffi, Connection};

/// Output of the last statement in a run.
pub(crate) enum StreamEvent {
    Schema(SchemaRef),
    Batch(RecordBatch),
}

fn c_string(text: &str) -> Result<CString, String> {
    CString::new(text).map_err(|_| format!("Text contains a NUL byte: {text:?}"))
}

/// Copies an engine-owned message, or `fallback` when there is none.
///
/// # Safety
/// `message` must be null or point to a NUL-terminated string.
unsafe fn message_from(message: *const c_char, fallback: &str) -> String {
    if message.is_null() {
        fallback.to_string()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    }
}

/// Settings passed to `duckdb_open_ext`.
struct OpenConfig(ffi::duckdb_config);

impl OpenConfig {
    fn new() -> Result<Self, String> {
        let mut raw = ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer.
        if unsafe { ffi::duckdb_create_config(&mut raw) } != ffi::DuckDBSuccess {
            return Err("Failed to create DuckDB config".into());
        }
        Ok(Self(raw))
    }

    fn set(&mut self, name: &str, value: &str) -> Result<(), String> {
        let c_name = c_string(name)?;
        let c_value = c_string(value)?;
        // SAFETY: the config is live and both strings outlive the call.
        let state = unsafe { ffi::duckdb_set_config(self.0, c_name.as_ptr(), c_value.as_ptr()) };
        if state != ffi::DuckDBSuccess {
            return Err(format!("Invalid DuckDB setting {name}={value}"));
        }
        Ok(())
    }
}

impl Drop for OpenConfig {
    fn drop(&mut self) {
        // SAFETY: created by `duckdb_create_config` and destroyed once.
        unsafe { ffi::duckdb_destroy_config(&mut self.0) }
    }
}

/// An open database instance, closed when the last handle goes away.
///
/// Raw connections hold a handle, so a statement still unwinding after an
/// interrupt never sees a closed instance.
pub(crate) struct Database {
    raw: ffi::duckdb_database,
}

// SAFETY: a DuckDB instance is internally synchronized.
unsafe impl Send for Database {}
unsafe impl Sync for Database {}

impl Database {
    /// Opens `path`. `:memory:` opens a private in-memory database.
    pub(crate) fn open(path: &str, threads: Option<u32>) -> Result<Arc<Self>, String> {
        let mut config = OpenConfig::new()?;
        if let Some(threads) = threads {
            config.set("threads", &threads.to_string())?;
        }

        let c_path = c_string(path)?;
        let mut raw = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();
        // SAFETY: every pointer is valid for the duration of the call.
        let state = unsafe { ffi::duckdb_open_ext(c_path.as_ptr(), &mut raw, config.0, &mut error) };
        if state != ffi::DuckDBSuccess {
            // SAFETY: `error` is null or a string allocated by the engine.
            let message = unsafe { message_from(error, "Failed to open DuckDB") };
            if !error.is_null() {
                // SAFETY: freed exactly once, after copying.
                unsafe { ffi::duckdb_free(error.cast()) };
            }
            return Err(message);
        }
        Ok(Arc::new(Self { raw }))
    }

    /// Opens a connection for running statements.
    pub(crate) fn connect(self: &Arc<Self>) -> Result<RawConnection, String> {
        let mut raw = ptr::null_mut();
        // SAFETY: the instance stays open while `self` is alive.
        if unsafe { ffi::duckdb_connect(self.raw, &mut raw) } != ffi::DuckDBSuccess {
            return Err("Failed to connect to DuckDB".into());
        }
        Ok(RawConnection {
            raw,
            _database: Arc::clone(self),
        })
    }

    /// A `duckdb` crate connection to this instance.
    ///
    /// The connection does not keep the instance open; drop it before the
    /// last `Arc<Database>`.
    pub(crate) fn connection(&self) -> duckdb::Result<Connection> {
        // SAFETY: `open_from_raw` borrows the instance without closing it.
        unsafe { Connection::open_from_raw(self.raw) }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // SAFETY: opened by `duckdb_open_ext` and closed once.
        unsafe { ffi::duckdb_close(&mut self.raw) }
    }
}

/// A raw connection, shared with whoever may need to interrupt it.
pub(crate) struct RawConnection {
    raw: ffi::duckdb_connection,
    _database: Arc<Database>,
}

// SAFETY: the engine serializes statements per connection and
// `duckdb_interrupt` may be called from any thread.
unsafe impl Send for RawConnection {}
unsafe impl Sync for RawConnection {}

impl RawConnection {
    /// Interrupts the statement running on this connection, if any.
    pub(crate) fn interrupt(&self) {
        // SAFETY: the connection is open until drop.
        unsafe { ffi::duckdb_interrupt(self.raw) }
    }

    /// Runs every statement in `sql` in order, stopping at the first error.
    ///
    /// Only the last statement's result reaches `sink`, which returns false
    /// to stop reading it.
    pub(crate) fn run<F>(&self, sql: &str, mut sink: F) -> Result<(), String>
    where
        F: FnMut(StreamEvent) -> bool,
    {
        let statements = Statements::extract(self.raw, sql)?;
        for index in 0..statements.count {
            let prepared = statements.prepare(self.raw, index)?;
            let result = prepared.execute()?;
            if index + 1 == statements.count {
                result.stream(&mut sink)?;
            }
        }
        Ok(())
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        // SAFETY: connected by `duckdb_connect` and disconnected once.
        unsafe { ffi::duckdb_disconnect(&mut self.raw) }
    }
}

struct Statements {
    raw: ffi::duckdb_extracted_statements,
    count: u64,
}

impl Statements {
    fn extract(con: ffi::duckdb_connection, sql: &str) -> Result<Self, String> {
        let c_sql = c_string(sql)?;
        let mut raw = ptr::null_mut();
        // SAFETY: `con` is open and `c_sql` outlives the call.
        let count = unsafe { ffi::duckdb_extract_statements(con, c_sql.as_ptr(), &mut raw) };
        let statements = Self { raw, count };

        if count == 0 && !raw.is_null() {
            // SAFETY: the error string is owned by `raw`, copied before drop.
            let error = unsafe { ffi::duckdb_extract_statements_error(raw) };
            if !error.is_null() {
                return Err(unsafe { message_from(error, "") });
            }
        }
        Ok(statements)
    }

    fn prepare(&self, con: ffi::duckdb_connection, index: u64) -> Result<Prepared, String> {
        let mut raw = ptr::null_mut();
        // SAFETY: `index` is below the extracted count.
        let state =
            unsafe { ffi::duckdb_prepare_extracted_statement(con, self.raw, index, &mut raw) };
        let prepared = Prepared(raw);
        if state != ffi::DuckDBSuccess {
            // SAFETY: the error string lives until `prepared` is dropped.
            let error = unsafe { ffi::duckdb_prepare_error(prepared.0) };
            return Err(unsafe { message_from(error, "Failed to prepare statement") });
        }
        Ok(prepared)
    }
}

impl Drop for Statements {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            // SAFETY: destroyed once.
            unsafe { ffi::duckdb_destroy_extracted(&mut self.raw) }
        }
    }
}

struct Prepared(ffi::duckdb_prepared_statement);

impl Prepared {
    fn execute(&self) -> Result<ArrowResult, String> {
        let mut raw = ptr::null_mut();
        // SAFETY: the statement was prepared successfully.
        let state = unsafe { ffi::duckdb_execute_prepared_arrow(self.0, &mut raw) };
        let result = ArrowResult(raw);
        if state != ffi::DuckDBSuccess {
            return Err(result.error("Failed to execute statement"));
        }
        Ok(result)
    }
}

impl Drop for Prepared {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: destroyed once.
            unsafe { ffi::duckdb_destroy_prepare(&mut self.0) }
        }
    }
}

struct ArrowResult(ffi::duckdb_arrow);

impl ArrowResult {
    fn error(&self, fallback: &str) -> String {
        if self.0.is_null() {
            return fallback.to_string();
        }
        // SAFETY: the message is owned by the result and copied here.
        unsafe { message_from(ffi::duckdb_query_arrow_error(self.0), fallback) }
    }

    fn ffi_schema(&self) -> Result<FFI_ArrowSchema, String> {
        let mut schema = FFI_ArrowSchema::empty();
        // SAFETY: the engine exports into `schema`, which outlives the call.
        let state = unsafe {
            ffi::duckdb_query_arrow_schema(
                self.0,
                &mut ptr::addr_of_mut!(schema) as *mut _ as *mut ffi::duckdb_arrow_schema,
            )
        };
        if state != ffi::DuckDBSuccess {
            return Err(self.error("Failed to read result schema"));
        }
        Ok(schema)
    }

    /// The next chunk, or `None` once the result is exhausted.
    fn next_batch(&self, schema: &FFI_ArrowSchema) -> Result<Option<RecordBatch>, String> {
        let mut array = FFI_ArrowArray::empty();
        // SAFETY: the engine exports into `array`, which outlives the call.
        let state = unsafe {
            ffi::duckdb_query_arrow_array(
                self.0,
                &mut ptr::addr_of_mut!(array) as *mut _ as *mut ffi::duckdb_arrow_array,
            )
        };
        if state != ffi::DuckDBSuccess {
            return Err(self.error("Failed to fetch result batch"));
        }
        if array.is_empty() {
            return Ok(None);
        }

        // SAFETY: `array` was just exported against `schema`.
        let data = unsafe { from_ffi(array, schema) }.map_err(|e| e.to_string())?;
        Ok(Some(RecordBatch::from(StructArray::from(data))))
    }

    fn stream<F>(&self, sink: &mut F) -> Result<(), String>
    where
        F: FnMut(StreamEvent) -> bool,
    {
        let ffi_schema = self.ffi_schema()?;
        let schema = Schema::try_from(&ffi_schema).map_err(|e| e.to_string())?;
        if !sink(StreamEvent::Schema(Arc::new(schema))) {
            return Ok(());
        }
        while let Some(batch) = self.next_batch(&ffi_schema)? {
            if !sink(StreamEvent::Batch(batch)) {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for ArrowResult {
    fn drop(&mut self) {
        if !self.0.is_null() {
            // SAFETY: destroyed once.
            unsafe { ffi::duckdb_destroy_arrow(&mut self.0) }
        }
    }
}
