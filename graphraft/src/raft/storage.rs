use crate::config::{GroupConfiguration, Peer};
use crate::raft::segment::Segment;
use protobuf::Message;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const SEGMENT_MAX_BYTES: u64 = 64 << 20;
const META_FILE: &str = "raft_meta";
const SNAPSHOT_FILE: &str = "snapshot";

/// On-disk layout of one consensus group
#[derive(Debug, Clone)]
pub struct RaftPaths {
    pub log: PathBuf,
    pub meta: PathBuf,
    pub snapshot: PathBuf,
}

impl RaftPaths {
    pub fn new<P: AsRef<Path>>(base_path: P, group: &str) -> Self {
        let root = base_path.as_ref().join(group);
        RaftPaths {
            log: root.join("log"),
            meta: root.join("meta"),
            snapshot: root.join("snapshot"),
        }
    }

    /// Creates the directories and checks that they are writable
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [&self.log, &self.meta, &self.snapshot] {
            fs::create_dir_all(dir)?;
            let probe = dir.join(".probe");
            File::create(&probe)?;
            fs::remove_file(&probe)?;
        }
        Ok(())
    }
}

/// Term, vote, commit and membership, rewritten whenever one of them changes
#[derive(Debug, Default, Serialize, Deserialize)]
struct RaftMeta {
    term: u64,
    vote: u64,
    commit: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    peers: Vec<(u64, String)>,
}

fn store_error<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> raft::Error {
    raft::Error::Store(StorageError::Other(e.into()))
}

fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Raft storage kept in memory and mirrored to segment files, a meta file
/// and the last saved snapshot.
pub struct FileStorage {
    mem_storage: MemStorage,
    paths: RaftPaths,
    segments: BTreeMap<u64, Segment>,
    last_snapshot: Option<Snapshot>,
    peers: GroupConfiguration,
}

impl FileStorage {
    /// Loads the group state from `paths`. A node starting with empty
    /// directories bootstraps with every peer of `initial` as a voter.
    pub fn open(paths: RaftPaths, initial: &GroupConfiguration) -> Result<Self> {
        let mem_storage = MemStorage::new();

        // Load the last saved snapshot
        let mut last_snapshot = None;
        let snapshot_path = paths.snapshot.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let data = fs::read(&snapshot_path)?;
            let snapshot = Snapshot::parse_from_bytes(&data).map_err(store_error)?;
            mem_storage.wl().apply_snapshot(snapshot.clone())?;
            last_snapshot = Some(snapshot);
        }
        let snapshot_index = last_snapshot
            .as_ref()
            .map_or(0, |s: &Snapshot| s.get_metadata().index);

        // Replay segments in the order they were written
        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&paths.log)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let seq = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix("segment_")?
                    .strip_suffix(".log")?
                    .parse::<u64>()
                    .ok()?;
                Some((seq, path))
            })
            .collect();
        segment_files.sort_by_key(|(seq, _)| *seq);

        let mut segments = BTreeMap::new();
        for (seq, path) in segment_files {
            let mut segment = Segment::open(&path).map_err(store_error)?;
            for (index, data) in segment.read_all().map_err(store_error)? {
                if index <= snapshot_index {
                    continue;
                }
                let last_index = mem_storage.last_index()?;
                if index > last_index + 1 {
                    return Err(store_error(format!(
                        "raft log gap in {:?}: entry {} after {}",
                        path, index, last_index
                    )));
                }
                let entry = Entry::parse_from_bytes(&data).map_err(store_error)?;
                mem_storage.wl().append(&[entry])?;
            }
            segments.insert(seq, segment);
        }

        let peers = match Self::load_meta(&paths.meta)? {
            Some(meta) => {
                let last_index = mem_storage.last_index()?;
                let mut hs = HardState::default();
                hs.term = meta.term;
                hs.vote = meta.vote;
                hs.commit = meta.commit.max(snapshot_index).min(last_index);
                mem_storage.wl().set_hardstate(hs);
                mem_storage
                    .wl()
                    .set_conf_state(ConfState::from((meta.voters, meta.learners)));

                let mut peers = GroupConfiguration::default();
                for (id, addr) in meta.peers {
                    peers.insert(Peer::new(id, addr)).map_err(store_error)?;
                }
                peers
            }
            None => {
                if last_snapshot.is_none() {
                    mem_storage
                        .wl()
                        .set_conf_state(ConfState::from((initial.ids(), vec![])));
                }
                initial.clone()
            }
        };

        let storage = FileStorage {
            mem_storage,
            paths,
            segments,
            last_snapshot,
            peers,
        };
        storage.persist_meta()?;
        Ok(storage)
    }

    fn load_meta(dir: &Path) -> Result<Option<RaftMeta>> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        let meta = bincode::deserialize(&data).map_err(store_error)?;
        Ok(Some(meta))
    }

    fn persist_meta(&self) -> Result<()> {
        let state = self.mem_storage.initial_state()?;
        let meta = RaftMeta {
            term: state.hard_state.term,
            vote: state.hard_state.vote,
            commit: state.hard_state.commit,
            voters: state.conf_state.voters.clone(),
            learners: state.conf_state.learners.clone(),
            peers: self
                .peers
                .peers()
                .into_iter()
                .map(|p| (p.id, p.addr))
                .collect(),
        };
        let data = bincode::serialize(&meta).map_err(store_error)?;
        write_atomically(&self.paths.meta.join(META_FILE), &data)
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let data = snapshot.write_to_bytes().map_err(store_error)?;
        write_atomically(&self.paths.snapshot.join(SNAPSHOT_FILE), &data)
    }

    fn active_segment(&mut self) -> Result<&mut Segment> {
        let roll = match self.segments.values().next_back() {
            Some(segment) => segment.size() >= SEGMENT_MAX_BYTES,
            None => true,
        };
        if roll {
            let seq = self.segments.keys().next_back().map_or(1, |seq| seq + 1);
            let path = self.paths.log.join(format!("segment_{}.log", seq));
            let segment = Segment::open(path).map_err(store_error)?;
            self.segments.insert(seq, segment);
        }
        self.segments
            .values_mut()
            .next_back()
            .ok_or_else(|| store_error("no active raft log segment"))
    }

    /// Membership with peer addresses, as last persisted
    pub fn peers(&self) -> &GroupConfiguration {
        &self.peers
    }

    pub fn set_peers(&mut self, peers: GroupConfiguration) -> Result<()> {
        self.peers = peers;
        self.persist_meta()
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.last_snapshot
            .as_ref()
            .map_or(0, |s| s.get_metadata().index)
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem_storage.wl().append(entries)?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push((entry.index, entry.write_to_bytes().map_err(store_error)?));
        }
        self.active_segment()?
            .append(&records)
            .map_err(store_error)
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) -> Result<()> {
        self.mem_storage.wl().set_conf_state(conf_state);
        self.persist_meta()
    }

    pub fn set_hardstate(&mut self, hs: HardState) -> Result<()> {
        self.mem_storage.wl().set_hardstate(hs);
        self.persist_meta()
    }

    pub fn set_commit(&mut self, commit: u64) -> Result<()> {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
        self.persist_meta()
    }

    /// Installs a snapshot received from the leader. The local log is
    /// replaced by it.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.write_snapshot(snapshot)?;
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        for (_, segment) in std::mem::take(&mut self.segments) {
            segment.remove()?;
        }
        self.last_snapshot = Some(snapshot.clone());
        self.persist_meta()
    }

    /// Saves the state machine image taken at `applied` and compacts the log
    /// up to it.
    pub fn save_snapshot(&mut self, data: Vec<u8>, applied: u64) -> Result<()> {
        if applied <= self.snapshot_index() {
            return Ok(());
        }
        let term = self.mem_storage.term(applied)?;
        let state = self.mem_storage.initial_state()?;

        let mut snapshot = Snapshot::default();
        snapshot.set_data(data.into());
        snapshot.mut_metadata().index = applied;
        snapshot.mut_metadata().term = term;
        snapshot.mut_metadata().set_conf_state(state.conf_state);
        self.write_snapshot(&snapshot)?;

        // the in-memory log restarts right after the snapshot, as it does
        // when reloaded from disk
        let last_index = self.mem_storage.last_index()?;
        let tail = if last_index > applied {
            self.mem_storage.entries(
                applied + 1,
                last_index + 1,
                None,
                GetEntriesContext::empty(false),
            )?
        } else {
            Vec::new()
        };
        let mut marker = Snapshot::default();
        marker.set_metadata(snapshot.get_metadata().clone());
        {
            let mut core = self.mem_storage.wl();
            core.apply_snapshot(marker)?;
            core.set_hardstate(state.hard_state);
            core.append(&tail)?;
        }

        let active = self.segments.keys().next_back().copied();
        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(seq, segment)| Some(**seq) != active && segment.max_index() <= applied)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in covered {
            if let Some(segment) = self.segments.remove(&seq) {
                segment.remove()?;
            }
        }

        self.last_snapshot = Some(snapshot);
        Ok(())
    }
}

impl Storage for FileStorage {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Only saved snapshots carry state machine data, so lagging peers wait
    /// until one covering `request_index` exists.
    fn snapshot(&self, request_index: u64, _to: u64) -> Result<Snapshot> {
        match &self.last_snapshot {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => {
                Ok(snapshot.clone())
            }
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.set_data(data.to_vec().into());
        e
    }

    fn group() -> GroupConfiguration {
        GroupConfiguration::parse("127.0.0.1:1,127.0.0.1:2,127.0.0.1:3").unwrap()
    }

    fn open(dir: &TempDir) -> FileStorage {
        let paths = RaftPaths::new(dir.path(), "graph");
        paths.prepare().unwrap();
        FileStorage::open(paths, &group()).unwrap()
    }

    #[test]
    fn test_bootstrap_with_all_voters() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1, 2, 3]);
        assert_eq!(storage.last_index().unwrap(), 0);
        assert_eq!(storage.peers().len(), 3);
        assert!(dir.path().join("graph/meta").join(META_FILE).exists());
    }

    #[test]
    fn test_reload_entries_and_hard_state() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = open(&dir);
            storage
                .append_entries(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
                .unwrap();
            // conflicting tail from a new leader
            storage.append_entries(&[entry(3, 2, b"x")]).unwrap();
            let mut hs = HardState::default();
            hs.term = 2;
            hs.vote = 3;
            hs.commit = 2;
            storage.set_hardstate(hs).unwrap();
        }

        let storage = open(&dir);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(3).unwrap(), 2);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.vote, 3);
        assert_eq!(state.hard_state.commit, 2);
    }

    #[test]
    fn test_save_snapshot_compacts() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = open(&dir);
            let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1, b"e")).collect();
            storage.append_entries(&entries).unwrap();
            storage.set_commit(5).unwrap();
            storage.save_snapshot(b"image".to_vec(), 4).unwrap();

            assert_eq!(storage.first_index().unwrap(), 5);
            assert_eq!(storage.last_index().unwrap(), 5);
            assert_eq!(storage.term(4).unwrap(), 1);
            assert_eq!(storage.initial_state().unwrap().hard_state.commit, 5);
            assert_eq!(storage.snapshot_index(), 4);
            // nothing new applied, nothing to save
            storage.save_snapshot(b"stale".to_vec(), 4).unwrap();
            let snapshot = storage.snapshot(0, 2).unwrap();
            assert_eq!(&snapshot.get_data()[..], b"image");
            assert!(storage.snapshot(5, 2).is_err());
        }

        let storage = open(&dir);
        assert_eq!(storage.snapshot_index(), 4);
        assert_eq!(storage.first_index().unwrap(), 5);
        assert_eq!(storage.last_index().unwrap(), 5);
        assert_eq!(storage.term(4).unwrap(), 1);
        assert_eq!(&storage.last_snapshot().unwrap().get_data()[..], b"image");
        assert_eq!(storage.initial_state().unwrap().hard_state.commit, 5);
    }

    #[test]
    fn test_save_snapshot_covering_whole_log() {
        let dir = TempDir::new().unwrap();
        let mut storage = open(&dir);
        let entries: Vec<Entry> = (1..=3).map(|i| entry(i, 2, b"e")).collect();
        storage.append_entries(&entries).unwrap();
        storage.set_commit(3).unwrap();
        storage.save_snapshot(b"image".to_vec(), 3).unwrap();

        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(3).unwrap(), 2);
        storage.append_entries(&[entry(4, 2, b"f")]).unwrap();
        drop(storage);

        let storage = open(&dir);
        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 4);
        assert_eq!(storage.term(3).unwrap(), 2);
    }

    #[test]
    fn test_apply_snapshot_replaces_log() {
        let dir = TempDir::new().unwrap();
        let mut storage = open(&dir);
        storage
            .append_entries(&[entry(1, 1, b"a"), entry(2, 1, b"b")])
            .unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.set_data(b"leader image".to_vec().into());
        snapshot.mut_metadata().index = 10;
        snapshot.mut_metadata().term = 3;
        snapshot
            .mut_metadata()
            .set_conf_state(ConfState::from((vec![1, 2, 3], vec![])));
        storage.apply_snapshot(&snapshot).unwrap();
        assert_eq!(storage.last_index().unwrap(), 10);

        storage.append_entries(&[entry(11, 3, b"c")]).unwrap();
        drop(storage);

        let storage = open(&dir);
        assert_eq!(storage.first_index().unwrap(), 11);
        assert_eq!(storage.last_index().unwrap(), 11);
        assert_eq!(storage.term(11).unwrap(), 3);
    }

    #[test]
    fn test_peers_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = open(&dir);
            let mut peers = storage.peers().clone();
            peers.insert(Peer::new(4, "127.0.0.1:4")).unwrap();
            storage.set_peers(peers).unwrap();
        }
        let storage = open(&dir);
        assert_eq!(storage.peers().ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_prepare_fails_under_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(RaftPaths::new(&file, "graph").prepare().is_err());
    }
}
