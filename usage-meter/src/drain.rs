use std::{
    io, mem,
    os::fd::{AsFd, AsRawFd},
    time::{Duration, Instant},
};

use aya::maps::{Map, MapData};
use thiserror::Error;
use tracing::debug;

use crate::model::{CounterDelta, Direction, HwAddr};

// Command number of BPF_MAP_LOOKUP_AND_DELETE_BATCH in the bpf(2) ABI.
const BPF_MAP_LOOKUP_AND_DELETE_BATCH: libc::c_long = 25;

/// Upper bound for page buffers grown to fit a single oversized hash bucket.
pub const MAX_PAGE_ENTRIES: usize = 1 << 16;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("batch lookup-and-delete on {direction} table failed")]
    Batch {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("{direction} drain exceeded its {limit:?} deadline after {pages} pages")]
    Deadline {
        direction: Direction,
        limit: Duration,
        pages: usize,
    },
}

/// Opaque continuation token between pages of one drain pass.
#[derive(Debug, Default)]
pub struct BatchCursor {
    token: u64,
    started: bool,
}

impl BatchCursor {
    #[cfg(test)]
    pub fn position(&self) -> Option<u64> {
        self.started.then_some(self.token)
    }

    pub fn advance(&mut self, token: u64) {
        self.token = token;
        self.started = true;
    }
}

/// One page of a destructive batch read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BatchPage {
    /// Number of leading entries of the key/value buffers that were filled.
    pub count: usize,
    /// The table reported no more entries after this page.
    pub exhausted: bool,
}

/// A kernel table of per-address byte counters that supports destructive
/// paged reads.
pub trait CounterTable {
    /// Moves up to `keys.len()` entries out of the table into the buffers.
    ///
    /// Fails with `ENOSPC`, leaving the cursor untouched, when the next
    /// bucket holds more entries than the buffers can take.
    fn pop_batch(
        &mut self,
        cursor: &mut BatchCursor,
        keys: &mut [u64],
        values: &mut [u64],
    ) -> io::Result<BatchPage>;
}

#[repr(C)]
#[derive(Default)]
struct BatchAttr {
    in_batch: u64,
    out_batch: u64,
    keys: u64,
    values: u64,
    count: u32,
    map_fd: u32,
    elem_flags: u64,
    flags: u64,
}

/// A `u64 -> u64` hash map owned by the loaded tc programs.
pub struct BpfCounterTable {
    map: MapData,
}

impl BpfCounterTable {
    pub fn new(map: Map) -> io::Result<Self> {
        match map {
            Map::HashMap(map) | Map::LruHashMap(map) => Ok(Self { map }),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "usage map is not a hash map",
            )),
        }
    }
}

impl CounterTable for BpfCounterTable {
    fn pop_batch(
        &mut self,
        cursor: &mut BatchCursor,
        keys: &mut [u64],
        values: &mut [u64],
    ) -> io::Result<BatchPage> {
        let capacity = keys.len().min(values.len());
        let mut out_token: u64 = 0;
        let mut attr = BatchAttr {
            in_batch: if cursor.started {
                &cursor.token as *const u64 as u64
            } else {
                0
            },
            out_batch: &mut out_token as *mut u64 as u64,
            keys: keys.as_mut_ptr() as u64,
            values: values.as_mut_ptr() as u64,
            count: u32::try_from(capacity).unwrap_or(u32::MAX),
            map_fd: self.map.fd().as_fd().as_raw_fd() as u32,
            ..Default::default()
        };

        let rc = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_LOOKUP_AND_DELETE_BATCH,
                &mut attr as *mut BatchAttr,
                mem::size_of::<BatchAttr>() as libc::c_uint,
            )
        };
        let count = (attr.count as usize).min(capacity);
        if rc < 0 {
            let err = io::Error::last_os_error();
            // ENOENT marks the end of the table; `count` still holds the
            // entries returned alongside it.
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(BatchPage {
                    count,
                    exhausted: true,
                });
            }
            return Err(err);
        }

        cursor.advance(out_token);
        Ok(BatchPage {
            count,
            exhausted: false,
        })
    }
}

/// Result of draining one direction. Deltas drained before an error are kept
/// because the kernel already deleted them.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub deltas: Vec<CounterDelta>,
    pub pages: usize,
    pub error: Option<DrainError>,
}

pub struct Drainer<T> {
    ingress: T,
    egress: T,
    keys: Vec<u64>,
    values: Vec<u64>,
    deadline: Option<Duration>,
}

impl<T: CounterTable> Drainer<T> {
    pub fn new(ingress: T, egress: T, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            ingress,
            egress,
            keys: vec![0; page_size],
            values: vec![0; page_size],
            deadline: None,
        }
    }

    /// Soft limit for a single direction's pass, checked between pages.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Pulls every pending counter out of one direction's table.
    pub fn drain(&mut self, direction: Direction) -> DrainOutcome {
        let started = Instant::now();
        let table = match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        };
        let mut cursor = BatchCursor::default();
        let mut outcome = DrainOutcome::default();

        loop {
            let page = match table.pop_batch(&mut cursor, &mut self.keys, &mut self.values) {
                Ok(page) => page,
                Err(err)
                    if err.raw_os_error() == Some(libc::ENOSPC)
                        && self.keys.len() < MAX_PAGE_ENTRIES =>
                {
                    let len = (self.keys.len() * 2).min(MAX_PAGE_ENTRIES);
                    debug!(%direction, len, "hash bucket exceeds page, growing buffers");
                    self.keys.resize(len, 0);
                    self.values.resize(len, 0);
                    continue;
                }
                Err(source) => {
                    outcome.error = Some(DrainError::Batch { direction, source });
                    break;
                }
            };
            outcome.pages += 1;
            outcome.deltas.extend(
                self.keys[..page.count]
                    .iter()
                    .zip(&self.values[..page.count])
                    .filter(|&(_, &bytes)| bytes != 0)
                    .map(|(&key, &bytes)| CounterDelta {
                        hwaddr: HwAddr::from_key(key),
                        bytes,
                    }),
            );
            if page.exhausted {
                break;
            }
            if let Some(limit) = self.deadline {
                if started.elapsed() >= limit {
                    outcome.error = Some(DrainError::Deadline {
                        direction,
                        limit,
                        pages: outcome.pages,
                    });
                    break;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stand-in for a kernel counter table.
    #[derive(Default)]
    pub struct FakeTable {
        pub entries: VecDeque<(u64, u64)>,
        pub fail_after_pages: Option<usize>,
        pub pages_served: usize,
        /// Entries sharing the head bucket; smaller buffers get `ENOSPC`.
        pub head_bucket: usize,
    }

    impl FakeTable {
        pub fn with(entries: &[(u64, u64)]) -> Self {
            Self {
                entries: entries.iter().copied().collect(),
                ..Default::default()
            }
        }
    }

    impl CounterTable for FakeTable {
        fn pop_batch(
            &mut self,
            cursor: &mut BatchCursor,
            keys: &mut [u64],
            values: &mut [u64],
        ) -> io::Result<BatchPage> {
            if self.fail_after_pages == Some(self.pages_served) {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            if self.head_bucket > keys.len() {
                return Err(io::Error::from_raw_os_error(libc::ENOSPC));
            }
            self.head_bucket = 0;
            self.pages_served += 1;
            let mut count = 0;
            while count < keys.len() {
                let Some((key, value)) = self.entries.pop_front() else {
                    break;
                };
                keys[count] = key;
                values[count] = value;
                count += 1;
            }
            if self.entries.is_empty() {
                return Ok(BatchPage {
                    count,
                    exhausted: true,
                });
            }
            cursor.advance(cursor.position().unwrap_or(0) + count as u64);
            Ok(BatchPage {
                count,
                exhausted: false,
            })
        }
    }

    #[test]
    fn drain_pages_until_end_of_table() {
        let entries: Vec<(u64, u64)> = (1..=10).map(|k| (k, k * 100)).collect();
        let mut drainer = Drainer::new(FakeTable::with(&entries), FakeTable::default(), 4);

        let outcome = drainer.drain(Direction::Ingress);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.deltas.len(), 10);
        assert_eq!(outcome.deltas[9].bytes, 1000);
        assert!(drainer.ingress.entries.is_empty());
    }

    #[test]
    fn drain_discards_zero_deltas() {
        let mut drainer = Drainer::new(
            FakeTable::default(),
            FakeTable::with(&[(1, 0), (2, 5), (3, 0)]),
            4096,
        );
        let outcome = drainer.drain(Direction::Egress);
        assert_eq!(
            outcome.deltas,
            vec![CounterDelta {
                hwaddr: HwAddr::from_key(2),
                bytes: 5
            }]
        );
    }

    #[test]
    fn empty_table_is_not_an_error() {
        let mut drainer = Drainer::new(FakeTable::default(), FakeTable::default(), 16);
        let outcome = drainer.drain(Direction::Ingress);
        assert!(outcome.error.is_none());
        assert!(outcome.deltas.is_empty());
    }

    #[test]
    fn error_keeps_pages_already_drained() {
        let entries: Vec<(u64, u64)> = (1..=6).map(|k| (k, 1)).collect();
        let mut table = FakeTable::with(&entries);
        table.fail_after_pages = Some(1);
        let mut drainer = Drainer::new(table, FakeTable::default(), 2);

        let outcome = drainer.drain(Direction::Ingress);
        assert_eq!(outcome.deltas.len(), 2);
        assert!(matches!(
            outcome.error,
            Some(DrainError::Batch {
                direction: Direction::Ingress,
                ..
            })
        ));
        assert_eq!(drainer.ingress.entries.len(), 4);
    }

    #[test]
    fn oversized_bucket_grows_page_buffers() {
        let entries: Vec<(u64, u64)> = (1..=6).map(|k| (k, 10)).collect();
        let mut table = FakeTable::with(&entries);
        table.head_bucket = 3;
        let mut drainer = Drainer::new(table, FakeTable::default(), 1);

        let outcome = drainer.drain(Direction::Ingress);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.deltas.len(), 6);
        assert_eq!(drainer.keys.len(), 4);
        assert!(drainer.ingress.entries.is_empty());
    }

    #[test]
    fn bucket_larger_than_page_limit_is_an_error() {
        let mut table = FakeTable::with(&[(1, 1), (2, 1)]);
        table.head_bucket = MAX_PAGE_ENTRIES + 1;
        let mut drainer = Drainer::new(table, FakeTable::default(), MAX_PAGE_ENTRIES);

        let outcome = drainer.drain(Direction::Ingress);
        assert!(matches!(outcome.error, Some(DrainError::Batch { .. })));
        assert_eq!(drainer.ingress.entries.len(), 2);
    }

    #[test]
    fn deadline_stops_between_pages() {
        let entries: Vec<(u64, u64)> = (1..=6).map(|k| (k, 1)).collect();
        let mut drainer = Drainer::new(FakeTable::with(&entries), FakeTable::default(), 2)
            .with_deadline(Some(Duration::ZERO));

        let outcome = drainer.drain(Direction::Ingress);
        assert_eq!(outcome.pages, 1);
        assert!(matches!(outcome.error, Some(DrainError::Deadline { .. })));
        assert_eq!(drainer.ingress.entries.len(), 4);
    }
}
