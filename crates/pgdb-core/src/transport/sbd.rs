//! Scalable binary distribution: the side-channel GDB uses to fetch shared
//! objects from disk without every rank hitting the filesystem
//! independently (spec.md §4.4).
//!
//! A per-host shared-memory region, guarded by a named event used as a
//! binary semaphore, carries a request (back-end → front-end) or a
//! response (front-end → back-end) in one direction at a time: a flag
//! byte, a `u32` length, then that many bytes.

use std::io;

use raw_sync::Timeout;
use raw_sync::events::{Event, EventInit, EventState};
use shared_memory::{Shmem, ShmemConf, ShmemError};

const FLAG_OFFSET: usize = 0;
const LEN_OFFSET: usize = 1;
const DATA_OFFSET: usize = 5;

/// What the region currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Idle,
    /// A back-end has published a path it wants loaded.
    Request,
    /// The front-end has published file bytes (or an error sentinel).
    Response,
}

impl Direction {
    fn to_byte(self) -> u8 {
        match self {
            Direction::Idle => 0,
            Direction::Request => 1,
            Direction::Response => 2,
        }
    }

    fn from_byte(b: u8) -> Direction {
        match b {
            1 => Direction::Request,
            2 => Direction::Response,
            _ => Direction::Idle,
        }
    }
}

/// The sentinel written back when a request cannot be satisfied, per
/// spec.md §7 (SBD-policy-reject / file-read-error never hang GDB).
pub const ERROR_SENTINEL: &str = "error";

/// A handle onto the shared region and the event used to signal across
/// the back-end/front-end boundary. `capacity` bounds the payload that
/// can be written past the 5-byte header.
pub struct SbdRegion {
    shmem: Shmem,
    event: Box<dyn Event>,
    capacity: usize,
}

// SAFETY: the shared-memory mapping and the event built on top of it are
// intended to cross process (and therefore thread) boundaries by design;
// all access is mediated by `acquire`/`release` around the event.
unsafe impl Send for SbdRegion {}

impl SbdRegion {
    /// Creates a new named region (the front-end/launcher side owns
    /// creation; back-ends open the same name).
    pub fn create(os_id: &str, capacity: usize) -> io::Result<Self> {
        let shmem = ShmemConf::new().os_id(os_id).size(capacity + DATA_OFFSET + Event::size_of(None)).create()
            .map_err(shmem_err)?;
        // SAFETY: `shmem`'s base pointer is valid for its full mapped size,
        // which we sized to include room for the event below the header.
        let (event, _) = unsafe { Event::new(event_ptr(&shmem), true) }.map_err(raw_sync_err)?;
        Ok(SbdRegion { shmem, event, capacity })
    }

    /// Opens a region a [`Self::create`] call elsewhere has already set up.
    pub fn open(os_id: &str) -> io::Result<Self> {
        let shmem = ShmemConf::new().os_id(os_id).open().map_err(shmem_err)?;
        let capacity = shmem.len().saturating_sub(DATA_OFFSET + Event::size_of(None));
        // SAFETY: the creator already initialized the event at this offset.
        let (event, _) = unsafe { Event::new(event_ptr(&shmem), false) }.map_err(raw_sync_err)?;
        Ok(SbdRegion { shmem, event, capacity })
    }

    fn header(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Non-blocking poll: returns the current direction and, if it is not
    /// `Idle`, the payload bytes published there.
    pub fn poll(&self) -> io::Result<(Direction, Vec<u8>)> {
        match self.event.wait(Timeout::Val(std::time::Duration::from_millis(0))) {
            Ok(()) => {}
            Err(raw_sync::Error::Timeout) => return Ok((Direction::Idle, Vec::new())),
            Err(e) => return Err(raw_sync_err(e)),
        }
        // SAFETY: header points into a mapping at least DATA_OFFSET + capacity
        // bytes long, established by `create`/`open`.
        let (direction, payload) = unsafe {
            let base = self.header();
            let direction = Direction::from_byte(*base.add(FLAG_OFFSET));
            let len = u32::from_le_bytes(
                std::slice::from_raw_parts(base.add(LEN_OFFSET), 4).try_into().expect("4 bytes"),
            ) as usize;
            let len = len.min(self.capacity);
            let payload = std::slice::from_raw_parts(base.add(DATA_OFFSET), len).to_vec();
            (direction, payload)
        };
        self.event.set(EventState::Clear).map_err(raw_sync_err)?;
        Ok((direction, payload))
    }

    /// Publishes `payload` in `direction` and releases the event,
    /// unblocking whichever side is waiting.
    pub fn publish(&self, direction: Direction, payload: &[u8]) -> io::Result<()> {
        if payload.len() > self.capacity {
            return Err(io::Error::other(format!(
                "sbd payload of {} bytes exceeds region capacity {}",
                payload.len(),
                self.capacity
            )));
        }
        // SAFETY: see `poll`; we never write past DATA_OFFSET + capacity.
        unsafe {
            let base = self.header();
            *base.add(FLAG_OFFSET) = direction.to_byte();
            std::ptr::copy_nonoverlapping((payload.len() as u32).to_le_bytes().as_ptr(), base.add(LEN_OFFSET), 4);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(DATA_OFFSET), payload.len());
        }
        self.event.set(EventState::Signaled).map_err(raw_sync_err)
    }

    pub fn publish_error(&self, direction: Direction) -> io::Result<()> {
        self.publish(direction, ERROR_SENTINEL.as_bytes())
    }
}

fn event_ptr(shmem: &Shmem) -> *mut u8 {
    // SAFETY: `shmem`'s mapping is at least DATA_OFFSET bytes; the event
    // structure lives just past the header we manage by hand.
    unsafe { shmem.as_ptr().add(DATA_OFFSET) }
}

fn shmem_err(e: ShmemError) -> io::Error {
    io::Error::other(format!("sbd shared memory: {e}"))
}

fn raw_sync_err(e: raw_sync::Error) -> io::Error {
    io::Error::other(format!("sbd event: {e:?}"))
}

/// A back-end's policy for deciding whether to honor a load-file request
/// surfaced through the SBD region: the requested name must be a known
/// executable, or match a configured pattern, and must not be a debugger
/// script or a system library path.
#[derive(Debug, Clone, Default)]
pub struct LoadFilePolicy {
    pub known_executables: Vec<String>,
    pub allowed_patterns: Vec<String>,
}

impl LoadFilePolicy {
    const REFUSED_SUFFIXES: &'static [&'static str] = &[".gdb", ".py"];
    const REFUSED_PREFIXES: &'static [&'static str] = &["/lib64", "/usr/lib64", "/lib", "/usr/lib"];

    pub fn allows(&self, path: &str) -> bool {
        if Self::REFUSED_SUFFIXES.iter().any(|s| path.ends_with(s)) {
            return false;
        }
        if Self::REFUSED_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return false;
        }
        let name = path.rsplit('/').next().unwrap_or(path);
        if self.known_executables.iter().any(|e| e == name) {
            return true;
        }
        self.allowed_patterns.iter().any(|pat| glob_match(pat, name))
    }
}

/// Minimal `*`-only glob matcher, sufficient for the simple suffix/prefix
/// patterns a back-end's policy file declares.
fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, suffix)) => text.starts_with(prefix) && text.ends_with(suffix) && {
            let min_len = prefix.len() + suffix.len();
            text.len() >= min_len
        },
    }
}

/// De-duplicates concurrent load-file requests for the same path on the
/// front-end, so the file is read from disk at most once per path.
#[derive(Debug, Clone, Default)]
pub struct LoadFileDeduper {
    loaded: std::collections::HashSet<String>,
}

impl LoadFileDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `path` is seen, `false` on any
    /// subsequent call.
    pub fn should_load(&mut self, path: &str) -> bool {
        self.loaded.insert(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_refuses_debugger_scripts_and_python_extensions() {
        let policy = LoadFilePolicy::default();
        assert!(!policy.allows("/home/user/.gdbinit.gdb"));
        assert!(!policy.allows("pretty-printers.py"));
    }

    #[test]
    fn policy_refuses_system_library_paths() {
        let policy = LoadFilePolicy::default();
        assert!(!policy.allows("/lib64/libc.so.6"));
        assert!(!policy.allows("/usr/lib/libm.so"));
    }

    #[test]
    fn policy_allows_known_executables_and_patterns() {
        let policy = LoadFilePolicy {
            known_executables: vec!["myapp".to_string()],
            allowed_patterns: vec!["libmyapp*.so".to_string()],
        };
        assert!(policy.allows("/opt/build/myapp"));
        assert!(policy.allows("/opt/build/libmyapp_plugin.so"));
        assert!(!policy.allows("/opt/build/libother.so"));
    }

    #[test]
    fn deduper_loads_a_path_exactly_once() {
        let mut d = LoadFileDeduper::new();
        assert!(d.should_load("/opt/build/libfoo.so"));
        assert!(!d.should_load("/opt/build/libfoo.so"));
        assert!(d.should_load("/opt/build/libbar.so"));
    }

    #[test]
    fn direction_byte_roundtrips() {
        for d in [Direction::Idle, Direction::Request, Direction::Response] {
            assert_eq!(Direction::from_byte(d.to_byte()), d);
        }
    }
}
