use super::{Callback, Priority, Signal};
use crate::Error;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    fs::File,
    io::ErrorKind,
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::trace;

#[cfg(not(unix))]
mod fallback;
#[cfg(unix)]
mod unix;

#[cfg(not(unix))]
use fallback::Handle;
#[cfg(unix)]
use unix::Handle;

#[derive(Clone)]
pub struct Config {
    /// Directory that file names are resolved against.
    pub directory: PathBuf,

    /// Number of threads performing reads.
    pub threads: NonZeroUsize,
}

impl Config {
    pub const fn new(directory: PathBuf, threads: NonZeroUsize) -> Self {
        Self { directory, threads }
    }
}

/// Files in a directory, read on a shared thread pool.
#[derive(Clone)]
pub struct Storage {
    cfg: Config,
    pool: Arc<ThreadPool>,
}

impl Storage {
    pub fn new(cfg: Config) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(cfg.threads.get())
            .thread_name(|index| format!("filecache-read-{index}"))
            .build()?;
        Ok(Self {
            cfg,
            pool: Arc::new(pool),
        })
    }
}

impl super::Storage for Storage {
    type Reader = Reader;

    fn open(&self, name: &str) -> Result<Self::Reader, Error> {
        let path = self.cfg.directory.join(name);
        let file = File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::FileMissing(name.into()),
            _ => Error::OpenFailed(name.into(), e),
        })?;
        Ok(Reader {
            name: name.into(),
            handle: Arc::new(Handle::new(file)),
            pool: self.pool.clone(),
        })
    }
}

/// A file opened by [Storage].
pub struct Reader {
    name: String,
    handle: Arc<Handle>,
    pool: Arc<ThreadPool>,
}

impl super::Reader for Reader {
    type Request = Request;

    fn size(&self) -> Result<u64, Error> {
        self.handle
            .len()
            .map_err(|e| Error::SizeFailed(self.name.clone(), e))
    }

    /// Reads run in submission order; `priority` is not used.
    fn read(
        &self,
        offset: u64,
        len: usize,
        _priority: Priority,
        callback: Callback,
    ) -> Self::Request {
        let request = Request::default();
        let canceled = request.canceled.clone();
        let signal = request.signal.clone();
        let handle = self.handle.clone();
        self.pool.spawn(move || {
            let result = if canceled.load(Ordering::Acquire) {
                Err(Error::Canceled)
            } else {
                handle.read_at(offset, len)
            };
            trace!(offset, len, ok = result.is_ok(), "read complete");
            callback(result);
            signal.finish();
        });
        request
    }
}

/// A read issued by [Reader].
#[derive(Default)]
pub struct Request {
    canceled: Arc<AtomicBool>,
    signal: Arc<Signal>,
}

impl super::Request for Request {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn wait(&self) {
        self.signal.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{self, Cache},
        file::{Config as FileConfig, FileCache},
        storage::{Reader as _, Request as _, Storage as _},
        LINE_SIZE,
    };
    use bytes::Bytes;
    use commonware_macros::test_traced;
    use prometheus_client::registry::Registry;
    use rand::{rngs::StdRng, Rng as _, RngCore as _, SeedableRng as _};
    use std::{env, fs, sync::mpsc};

    fn setup(name: &str, contents: &[u8]) -> (Storage, PathBuf) {
        let mut rng = StdRng::from_entropy();
        let directory = env::temp_dir().join(format!("filecache_disk_{}", rng.gen::<u64>()));
        fs::create_dir_all(&directory).unwrap();
        fs::write(directory.join(name), contents).unwrap();
        let cfg = Config::new(directory.clone(), NonZeroUsize::new(2).unwrap());
        (Storage::new(cfg).unwrap(), directory)
    }

    fn random(len: usize) -> Vec<u8> {
        let mut contents = vec![0; len];
        StdRng::seed_from_u64(len as u64).fill_bytes(&mut contents);
        contents
    }

    #[test_traced]
    fn test_read_and_wait() {
        let contents = random(1000);
        let (storage, directory) = setup("blob", &contents);
        let reader = storage.open("blob").unwrap();
        assert_eq!(reader.size().unwrap(), 1000);

        let (sender, receiver) = mpsc::channel();
        let request = reader.read(
            100,
            200,
            Priority::Normal,
            Box::new(move |result| sender.send(result).unwrap()),
        );
        request.wait();
        let bytes = receiver.try_recv().unwrap().unwrap();
        assert_eq!(bytes, Bytes::copy_from_slice(&contents[100..300]));

        // Reading past the end of the file fails.
        let (sender, receiver) = mpsc::channel();
        let request = reader.read(
            900,
            200,
            Priority::High,
            Box::new(move |result| sender.send(result).unwrap()),
        );
        request.wait();
        assert!(matches!(receiver.recv().unwrap(), Err(Error::ShortRead)));

        fs::remove_dir_all(directory).unwrap();
    }

    #[test_traced]
    fn test_open_missing() {
        let (storage, directory) = setup("blob", b"data");
        assert!(matches!(
            storage.open("other"),
            Err(Error::FileMissing(name)) if name == "other"
        ));
        fs::remove_dir_all(directory).unwrap();
    }

    #[test_traced]
    fn test_file_cache_over_disk() {
        let contents = random(3 * LINE_SIZE + 1234);
        let (storage, directory) = setup("blob", &contents);
        let cache = Cache::new(cache::Config::default(), &mut Registry::default());
        let file = FileCache::open(&storage, "blob", FileConfig::new(cache.clone())).unwrap();
        assert_eq!(file.size(), contents.len() as u64);

        let offset = LINE_SIZE as u64 - 10;
        let len = 2 * LINE_SIZE;
        assert!(file.read_data(offset, len, Priority::Normal).is_none());
        file.wait_all();
        assert_eq!(file.in_flight(), 0);
        let data = file.read_data(offset, len, Priority::Normal).unwrap();
        assert_eq!(data, Bytes::copy_from_slice(&contents[offset as usize..][..len]));

        file.close();
        assert_eq!(cache.policy().free_slots(), cache.policy().capacity());
        fs::remove_dir_all(directory).unwrap();
    }
}
