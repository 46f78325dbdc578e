//! Persistent state as a stream of JSON events.
//!
//! The first event (index 0) creates the root document, every later event is
//! a JSON patch from the previous snapshot to the next. Loading replays the
//! whole stream. Appends are made under an exclusive file lock.

use anyhow::{bail, Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{de::IoRead, Deserializer, StreamDeserializer};
use std::{
    fs::{File, OpenOptions},
    io::{self, Seek as _, Write},
    path::Path,
    sync::Arc,
    time::Instant,
};
use tracing::{info, warn};

use crate::{diff::snapshot_patch, snapshot::StateSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StateEvent {
    pub index: u64,
    pub meta: StateEventMeta,
    pub patch: json_patch::Patch,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StateEventMeta {
    pub time: DateTime<Utc>,
    /// The snapshot serial the event produces.
    #[serde(default)]
    pub serial: u64,
}

pub struct StateEventStream<'a, R: io::Read> {
    iter: StreamDeserializer<'a, IoRead<R>, StateEvent>,
    /// The validated first event, handed out before the rest of the stream
    first_event: Option<StateEvent>,
}
impl<'a, R: io::Read> StateEventStream<'a, R> {
    pub fn open_from_reader(reader: R) -> Result<StateEventStream<'a, R>> {
        let deserializer = Deserializer::from_reader(reader);
        let mut iter = deserializer.into_iter();
        let first_event = match iter.next() {
            Some(Ok(ev @ StateEvent { index, .. })) => {
                if index != 0 {
                    bail!("Expected initial state event with index 0, got {}", index);
                }
                ev
            }
            Some(Err(e)) => bail!(
                "State file invalid: error parsing initial state event: {}",
                e
            ),
            None => bail!("State file invalid: no initial state event"),
        };
        Ok(StateEventStream {
            iter,
            first_event: Some(first_event),
        })
    }
}

impl<R: io::Read> Iterator for StateEventStream<'_, R> {
    type Item = Result<StateEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first_event.is_some() {
            self.first_event.take().map(Ok)
        } else {
            self.iter.next().map(|r| r.map_err(Into::into))
        }
    }
}

/// An open state file.
pub struct StateHandle {
    file: Arc<File>,
    locking: fd_lock::RwLock<Arc<File>>,
    expected_size: Option<u64>,
    next_index: u64,
}
impl StateHandle {
    /// Create a new state file holding an empty snapshot.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<StateHandle> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("creating state file {}", path.display()))?;
        let mut handle = Self::from_file(file);
        handle.append(&[&Self::init_event(&StateSnapshot::new())?])?;
        handle.next_index = 1;
        Ok(handle)
    }

    /// Open an existing state file and replay it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(StateHandle, StateSnapshot)> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening state file {}", path.display()))?;
        let mut handle = Self::from_file(file);
        let (snapshot, count) = {
            let reader = io::BufReader::new(handle.file.clone());
            read_events(reader).with_context(|| format!("loading state file {}", path.display()))?
        };
        handle.next_index = count;
        Ok((handle, snapshot))
    }

    /// Open `path`, creating it with an empty snapshot if it does not exist.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<(StateHandle, StateSnapshot)> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Ok((Self::create(path)?, StateSnapshot::new()))
        }
    }

    fn from_file(file: File) -> StateHandle {
        let file = Arc::new(file);
        let locking = fd_lock::RwLock::new(file.clone());
        StateHandle {
            file,
            locking,
            expected_size: None,
            next_index: 0,
        }
    }

    fn init_event(snapshot: &StateSnapshot) -> Result<StateEvent> {
        Ok(StateEvent {
            index: 0,
            meta: StateEventMeta {
                time: Utc::now(),
                serial: snapshot.serial,
            },
            patch: json_patch::Patch(vec![json_patch::PatchOperation::Add(
                json_patch::AddOperation {
                    path: "".parse().context("parsing the root JSON pointer")?,
                    value: snapshot.to_json()?,
                },
            )]),
        })
    }

    /// Record the transition from `old` to `new`.
    pub fn append_snapshot(&mut self, old: &StateSnapshot, new: &StateSnapshot) -> Result<()> {
        let event = StateEvent {
            index: self.next_index,
            meta: StateEventMeta {
                time: Utc::now(),
                serial: new.serial,
            },
            patch: snapshot_patch(old, new)?,
        };
        self.append(&[&event])?;
        self.next_index += 1;
        Ok(())
    }

    fn lock_write(
        locking: &mut fd_lock::RwLock<Arc<File>>,
    ) -> Result<fd_lock::RwLockWriteGuard<'_, Arc<File>>> {
        // Probe first so that only a contended lock is logged.
        let contended = matches!(
            locking.try_write(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        );
        if contended {
            info!("waiting for the state file write lock");
        }
        let start = Instant::now();
        let lock = locking.write().context("locking the state file")?;
        if contended {
            info!(waited = ?start.elapsed(), "acquired the state file write lock");
        }
        Ok(lock)
    }

    fn append(&mut self, events: &[&StateEvent]) -> Result<()> {
        let lock_guard = Self::lock_write(&mut self.locking)?;
        let pos = self.file.seek(io::SeekFrom::End(0))?;
        match self.expected_size {
            None => self.expected_size = Some(pos),
            Some(expected_size) => {
                if pos != expected_size {
                    warn!(
                        expected_size,
                        actual_size = pos,
                        "the state file was written by another process; \
                         inspect it before continuing, resources may have been orphaned"
                    );
                }
            }
        }
        let mut out = io::BufWriter::new(self.file.clone());
        for event in events {
            // One pretty-printed event per record, readable by humans.
            serde_json::to_writer_pretty(&mut out, event)?;
            out.write_all(b"\n")?;
        }
        out.into_inner().map_err(|e| e.into_error())?;

        self.expected_size = Some(self.file.stream_position()?);

        drop(lock_guard);
        Ok(())
    }
}

pub fn apply_state_event(state: &mut serde_json::Value, event: &StateEvent) -> Result<()> {
    json_patch::patch(state, &event.patch.0).map_err(Into::into)
}

/// Replay all events, returning the document and the number of events.
pub fn apply_state_events(
    state: &mut serde_json::Value,
    events: impl Iterator<Item = Result<StateEvent>>,
) -> Result<u64> {
    let mut count = 0;
    for event in events {
        let event = event?;
        if event.index != count {
            bail!(
                "State file invalid: expected event index {}, got {}",
                count,
                event.index
            );
        }
        apply_state_event(state, &event)
            .with_context(|| format!("applying state event {}", event.index))?;
        count += 1;
    }
    Ok(count)
}

/// Read a whole event stream into a snapshot.
pub fn read_events<R: io::Read>(reader: R) -> Result<(StateSnapshot, u64)> {
    let stream = StateEventStream::open_from_reader(reader)?;
    let mut doc = serde_json::json!({});
    let count = apply_state_events(&mut doc, stream)?;
    Ok((StateSnapshot::from_json(doc)?, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::sample;

    const BASIC_EXAMPLE: &str = r#"
    {
        "index": 0,
        "meta": {"time":"2024-03-04T07:40:00Z"},
        "patch": [
            {
                "op": "add",
                "value": { "_type": "terraneState", "formatVersion": 1, "serial": 0, "resources": {}, "outputs": {} },
                "path": ""
            }
        ]
    }
    {
        "index": 1,
        "meta": {"time":"2024-03-04T07:41:00Z", "serial": 1},
        "patch": [
            {
                "op": "add",
                "value": {
                    "provider": "provider.local",
                    "value": { "path": "a.txt", "contents": "Hi there" }
                },
                "path": "/resources/local_file.a"
            },
            { "op": "replace", "path": "/serial", "value": 1 }
        ]
    }
"#;

    #[test]
    fn reads_events_in_order() {
        let stream = StateEventStream::open_from_reader(BASIC_EXAMPLE.as_bytes()).unwrap();
        let events: Vec<_> = stream.collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().index, 0);
        assert_eq!(
            events[0].as_ref().unwrap().meta.time.to_rfc3339(),
            "2024-03-04T07:40:00+00:00"
        );
    }

    #[test]
    fn replays_events_into_a_snapshot() {
        let (snapshot, count) = read_events(BASIC_EXAMPLE.as_bytes()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(snapshot.serial, 1);
        let addrs: Vec<String> = snapshot.list(None).iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["local_file.a"]);
    }

    #[test]
    fn first_event_must_have_index_zero() {
        let input = r#"{"index":1,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]}"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn truncated_event_is_an_error() {
        let input = r#"{"index":0,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]"#;
        assert!(StateEventStream::open_from_reader(input.as_bytes()).is_err());
    }

    #[test]
    fn empty_file_is_an_error() {
        assert!(StateEventStream::open_from_reader("".as_bytes()).is_err());
    }

    #[test]
    fn gaps_in_the_index_are_an_error() {
        let input = r#"
            {"index":0,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]}
            {"index":2,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[]}
        "#;
        let err = read_events(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("expected event index 1, got 2"));
    }

    #[test]
    fn other_format_versions_are_rejected() {
        let input = r#"{"index":0,"meta":{"time":"2024-06-04T07:40:00Z"},"patch":[
            {"op":"add","path":"","value":{"_type":"terraneState","formatVersion":7}}
        ]}"#;
        let err = read_events(input.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("unsupported state format version 7"));
    }

    #[test]
    fn appended_snapshots_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut handle = StateHandle::create(&path).unwrap();
        let empty = StateSnapshot::new();
        let mut first = sample();
        first.serial = 1;
        handle.append_snapshot(&empty, &first).unwrap();
        let mut second = first.clone();
        second.serial = 2;
        second.outputs.clear();
        handle.append_snapshot(&first, &second).unwrap();
        drop(handle);

        let (mut handle, loaded) = StateHandle::open(&path).unwrap();
        assert_eq!(loaded, second);

        let mut third = second.clone();
        third.serial = 3;
        third.resources.clear();
        handle.append_snapshot(&second, &third).unwrap();
        drop(handle);

        let (_, loaded) = StateHandle::open(&path).unwrap();
        assert_eq!(loaded, third);
    }

    #[test]
    fn create_refuses_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        StateHandle::create(&path).unwrap();
        assert!(StateHandle::create(&path).is_err());
        let (_, loaded) = StateHandle::open_or_create(&path).unwrap();
        assert_eq!(loaded, StateSnapshot::new());
    }
}
