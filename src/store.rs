// Byte Store Adapter
// Moves a SQLite store image between a byte buffer and an in-memory connection.
//
// Lifecycle: Unopened -> Opened (schema not ensured) -> SchemaReady -> Closed
// Reads, aggregation and queries need SchemaReady; serialization needs any open state.

use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};
use std::borrow::Cow;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};

/// Every SQLite 3 image starts with this 16-byte magic string
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// The fixed database header occupies the first 100 bytes of page 1
const HEADER_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Unopened,
    /// Image loaded, schema not yet ensured
    Opened,
    SchemaReady,
    Closed,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HandleState::Unopened => "unopened",
            HandleState::Opened => "opened (schema not ensured)",
            HandleState::SchemaReady => "open with schema ensured",
            HandleState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// In-memory opened reference to a store image.
///
/// Owned explicitly by the caller and passed to every operation, so several
/// stores can live side by side (e.g. the two ends of a round trip).
pub struct Handle {
    conn: Option<Connection>,
    state: HandleState,
    config: LedgerConfig,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

impl Handle {
    /// A handle with no image behind it. Every operation fails with `NotReady`.
    pub fn unopened(config: LedgerConfig) -> Self {
        Handle {
            conn: None,
            state: HandleState::Unopened,
            config,
        }
    }

    /// A fresh, empty in-memory store (first-load case).
    pub fn create(config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory()?;
        debug!("created empty in-memory store");
        Ok(Handle {
            conn: Some(conn),
            state: HandleState::Opened,
            config,
        })
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn is_schema_ready(&self) -> bool {
        self.state == HandleState::SchemaReady
    }

    /// Release the connection. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "error while closing store connection");
            }
            debug!("store handle closed");
        }
        self.state = HandleState::Closed;
    }

    /// Connection for operations valid in any open state.
    pub(crate) fn open_connection(&self, operation: &'static str) -> Result<&Connection> {
        match (&self.conn, self.state) {
            (Some(conn), HandleState::Opened | HandleState::SchemaReady) => Ok(conn),
            _ => Err(self.not_ready(operation)),
        }
    }

    pub(crate) fn open_connection_mut(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut Connection> {
        let state = self.state;
        match (&mut self.conn, state) {
            (Some(conn), HandleState::Opened | HandleState::SchemaReady) => Ok(conn),
            _ => Err(LedgerError::NotReady { operation, state }),
        }
    }

    /// Connection for operations that need the ledger schema in place.
    pub(crate) fn ready_connection(&self, operation: &'static str) -> Result<&Connection> {
        match (&self.conn, self.state) {
            (Some(conn), HandleState::SchemaReady) => Ok(conn),
            _ => Err(self.not_ready(operation)),
        }
    }

    pub(crate) fn ready_connection_mut(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut Connection> {
        let state = self.state;
        match (&mut self.conn, state) {
            (Some(conn), HandleState::SchemaReady) => Ok(conn),
            _ => Err(LedgerError::NotReady { operation, state }),
        }
    }

    pub(crate) fn mark_schema_ready(&mut self) {
        if self.conn.is_some() {
            self.state = HandleState::SchemaReady;
        }
    }

    fn not_ready(&self, operation: &'static str) -> LedgerError {
        LedgerError::NotReady {
            operation,
            state: self.state,
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a store image with the default configuration.
pub fn open(bytes: &[u8]) -> Result<Handle> {
    open_with_config(bytes, LedgerConfig::default())
}

/// Open a store image. The bytes are copied into an in-memory database; the
/// returned handle does not borrow or alias the input buffer.
pub fn open_with_config(bytes: &[u8], config: LedgerConfig) -> Result<Handle> {
    config.validate()?;
    let page_size = check_header(bytes).map_err(|e| {
        warn!(len = bytes.len(), error = %e, "rejected store image");
        e
    })?;

    let staging = tempfile::tempdir()?;
    let staged_path = staging.path().join("import.db");
    std::fs::write(&staged_path, rollback_mode_image(bytes))?;

    let mut conn = Connection::open_in_memory()?;
    // An in-memory backup target must use the source page size
    conn.pragma_update(None, "page_size", page_size)?;
    conn.restore(DatabaseName::Main, &staged_path, None::<fn(Progress)>)
        .map_err(|e| LedgerError::corrupt(format!("engine rejected image: {}", e)))?;

    if config.verify_integrity {
        verify_integrity(&conn)?;
    }

    info!(bytes = bytes.len(), page_size, "opened store image");
    Ok(Handle {
        conn: Some(conn),
        state: HandleState::Opened,
        config,
    })
}

/// Serialize the store back into a standalone SQLite image.
pub fn serialize(handle: &Handle) -> Result<Vec<u8>> {
    let conn = handle.open_connection("serialize")?;

    let staging = tempfile::tempdir()?;
    let export_path = staging.path().join(&handle.config.export_file_name);
    conn.backup(DatabaseName::Main, &export_path, None)?;

    let bytes = std::fs::read(&export_path)?;
    info!(bytes = bytes.len(), "serialized store image");
    Ok(bytes)
}

/// Validates the fixed header and returns the page size it declares.
fn check_header(bytes: &[u8]) -> Result<u32> {
    if bytes.len() < HEADER_LEN {
        return Err(LedgerError::corrupt(format!(
            "image is {} bytes, shorter than the {}-byte SQLite header",
            bytes.len(),
            HEADER_LEN
        )));
    }
    if &bytes[..SQLITE_HEADER.len()] != SQLITE_HEADER {
        return Err(LedgerError::corrupt(
            "missing 'SQLite format 3' header".to_string(),
        ));
    }

    // Bytes 16..18: big-endian page size, where 1 encodes 65536
    let raw = u16::from_be_bytes([bytes[16], bytes[17]]) as u32;
    let page_size = if raw == 1 { 65_536 } else { raw };
    if !(512..=65_536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(LedgerError::corrupt(format!(
            "header declares invalid page size {}",
            page_size
        )));
    }
    if bytes.len() % page_size as usize != 0 {
        return Err(LedgerError::corrupt(format!(
            "image length {} is not a multiple of page size {}",
            bytes.len(),
            page_size
        )));
    }
    Ok(page_size)
}

/// WAL images (header bytes 18 and 19 set to 2) cannot be read by an in-memory
/// target. Only the main file is ever supplied, so marking the copy as a
/// rollback-journal image loses nothing.
fn rollback_mode_image(bytes: &[u8]) -> Cow<'_, [u8]> {
    if bytes[18] == 2 || bytes[19] == 2 {
        let mut image = bytes.to_vec();
        image[18] = 1;
        image[19] = 1;
        debug!("staging WAL-mode image as rollback-journal image");
        Cow::Owned(image)
    } else {
        Cow::Borrowed(bytes)
    }
}

fn verify_integrity(conn: &Connection) -> Result<()> {
    let mut stmt = conn
        .prepare("PRAGMA quick_check")
        .map_err(|e| LedgerError::corrupt(format!("integrity check failed: {}", e)))?;
    let problems = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| LedgerError::corrupt(format!("integrity check failed: {}", e)))?;

    match problems.as_slice() {
        [only] if only == "ok" => Ok(()),
        _ => Err(LedgerError::corrupt(format!(
            "integrity check reported: {}",
            problems.join("; ")
        ))),
    }
}
