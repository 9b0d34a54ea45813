//! Test harness: a miniature filesystem front end driving the intent log
//! against the in-memory pool, plus the replay side of it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use intentlog::error::GetDataError;
use intentlog::{
    write_itx, ChildIo, GetData, IntentLog, LogHeader, MemPool, Options, Replay, ReplayRecord,
    WriteHeader, WritePriority, WriteState, TX_WRITE,
};

/// Object store standing in for the filesystem: the live contents (what
/// `get_data` serves) and the contents reconstructed by replay.
#[derive(Default)]
pub struct TestFs {
    pub live: Mutex<HashMap<u64, Vec<u8>>>,
    pub replayed: Mutex<HashMap<u64, Vec<u8>>>,
}

impl TestFs {
    pub fn apply(map: &mut HashMap<u64, Vec<u8>>, object: u64, offset: u64, payload: &[u8]) {
        let data = map.entry(object).or_default();
        let end = offset as usize + payload.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(payload);
    }
}

/// `get_data` implementation backed by [`TestFs::live`].
pub struct FsData {
    fs: Arc<TestFs>,
    pool: Arc<MemPool>,
}

impl GetData for FsData {
    fn get_data(
        &self,
        _gen: u64,
        header: &mut WriteHeader,
        buf: Option<&mut [u8]>,
        child: &ChildIo,
    ) -> Result<(), GetDataError> {
        let live = self.fs.live.lock().unwrap();
        let data = match live.get(&header.object) {
            Some(data) => data,
            None => return Err(GetDataError::NotFound),
        };
        let start = header.offset as usize;
        let end = start + header.length as usize;
        if data.len() < end {
            return Err(GetDataError::NotFound);
        }
        let payload = data[start..end].to_vec();
        drop(live);

        match buf {
            Some(buf) => {
                // Need-copy: fill the in-block destination.
                buf[..payload.len()].copy_from_slice(&payload);
            }
            None => {
                // Indirect: write the data block ourselves and stamp its
                // pointer, enrolling the write under the block's child
                // aggregator.
                use intentlog::Pool as _;
                let txg = self.pool.tx_assign();
                let (bp, _) = self
                    .pool
                    .alloc_log_block(txg, payload.len() as u32)
                    .map_err(|_| GetDataError::Io)?;
                self.pool.tx_commit(txg);
                header.blkptr = bp;
                // The data block's device must be covered by the log
                // block's cache flushes.
                child.cover_block(&bp);
                let pool = Arc::clone(&self.pool);
                child.enroll(move || pool.write_block(&bp, &payload, WritePriority::Sync));
            }
        }
        Ok(())
    }
}

/// Replay handler applying records into [`TestFs::replayed`], checking
/// that record sequence numbers arrive strictly increasing.
pub struct Replayer {
    pub fs: Arc<TestFs>,
    pub pool: Arc<MemPool>,
    pub log: IntentLog<MemPool>,
    pub last_seq: u64,
    /// Simulated handler failures, decremented per failure.
    pub fail: u64,
}

impl Replay for Replayer {
    fn replay(&mut self, txtype: u64, record: &ReplayRecord<'_>) -> io::Result<()> {
        use intentlog::Pool as _;

        if self.fail > 0 {
            self.fail -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected replay failure"));
        }

        assert!(
            record.header.seq > self.last_seq,
            "replay out of order: {} after {}",
            record.header.seq,
            self.last_seq
        );
        self.last_seq = record.header.seq;

        if txtype == TX_WRITE {
            let wh = WriteHeader::decode(record.bytes)?;
            let payload: Vec<u8> = match record.data {
                Some(data) => data[..wh.length as usize].to_vec(),
                None => {
                    let start = WriteHeader::LEN;
                    record.bytes[start..start + wh.length as usize].to_vec()
                }
            };
            let txg = self.pool.tx_assign();
            TestFs::apply(
                &mut self.fs.replayed.lock().unwrap(),
                wh.object,
                wh.offset,
                &payload,
            );
            self.log.replaying(txg);
            self.pool.tx_commit(txg);
        }
        Ok(())
    }
}

pub struct Harness {
    pub pool: Arc<MemPool>,
    pub fs: Arc<TestFs>,
    pub log: IntentLog<MemPool>,
    /// Header as of the last checkpoint sync; what survives a crash.
    pub persisted: Arc<Mutex<LogHeader>>,
}

impl Harness {
    pub fn new(opts: Options) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        Harness::with_pool(MemPool::new(), LogHeader::default(), opts)
    }

    pub fn with_pool(pool: Arc<MemPool>, header: LogHeader, opts: Options) -> Harness {
        let fs = Arc::new(TestFs::default());
        let log = IntentLog::open(
            Arc::clone(&pool),
            1,
            header,
            FsData {
                fs: Arc::clone(&fs),
                pool: Arc::clone(&pool),
            },
            opts,
        );
        let persisted = Arc::new(Mutex::new(header));

        let hooked = log.clone();
        let snapshot = Arc::clone(&persisted);
        pool.on_sync(move |txg| {
            hooked.sync(txg);
            hooked.clean(txg);
            *snapshot.lock().unwrap() = hooked.header();
        });

        Harness {
            pool,
            fs,
            log,
            persisted,
        }
    }

    /// Apply a write to the live state and queue its record.
    pub fn write(&self, object: u64, offset: u64, payload: &[u8], state: WriteState, sync: bool) {
        use intentlog::Pool as _;

        TestFs::apply(&mut self.fs.live.lock().unwrap(), object, offset, payload);
        let mut itx = write_itx(object, offset, payload.len() as u64, state, payload);
        itx.sync = sync;
        let txg = self.pool.tx_assign();
        self.log.assign(itx, txg);
        self.pool.tx_commit(txg);
    }

    /// First commit on a fresh pool: creates the on-disk chain (which
    /// checkpoints everything queued so far), so that later scenario
    /// records actually travel through the log.
    pub fn prime(&self) {
        self.write(999, 0, &[0xee; 64], WriteState::Copied, true);
        self.log.commit(0);
    }

    /// Crash: drop the volatile cache, reopen from the persisted header,
    /// claim and replay. Returns the recovered harness.
    pub fn crash_and_recover(self) -> Harness {
        use intentlog::Pool as _;

        let Harness {
            pool,
            fs,
            log,
            persisted,
        } = self;
        drop(log);
        pool.crash();

        let header = *persisted.lock().unwrap();
        let recovered = Harness::with_pool(Arc::clone(&pool), header, Options::default());

        recovered.log.check_log_chain().expect("log chain check");
        let txg = recovered.pool.tx_assign();
        recovered.log.claim(txg).expect("claim");
        recovered.pool.tx_commit(txg);

        let mut replayer = Replayer {
            fs: Arc::clone(&recovered.fs),
            pool: Arc::clone(&recovered.pool),
            log: recovered.log.clone(),
            last_seq: 0,
            fail: 0,
        };
        recovered.log.replay(&mut replayer);

        // Carry the pre-crash live state over for comparisons.
        *recovered.fs.live.lock().unwrap() = fs.live.lock().unwrap().clone();
        recovered
    }

    pub fn replayed(&self, object: u64) -> Option<Vec<u8>> {
        self.fs.replayed.lock().unwrap().get(&object).cloned()
    }
}
