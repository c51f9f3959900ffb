//! Streaming payload files to an update module.
//!
//! While the module runs its `Download` state, payload files are offered to it
//! one at a time by writing `streams/<name>` into the `stream-next` FIFO and then
//! streaming the file into the FIFO `streams/<name>`. An empty entry in
//! `stream-next` signals that there are no more files.
//!
//! A module that exits without ever reading `stream-next` leaves the download to
//! the agent. In this case, the files are stored in the `files` directory instead.
//!
//! The download is an explicit state machine, [`ModuleDownload::handle_event`],
//! driven by the thread storing the payload. Writes to FIFOs block until the
//! module opens them, hence they are done by [`CopyTask`] threads which receive
//! the data in chunks over a channel.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvError, RecvTimeoutError, Selector, Sender, TryRecvError};
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::killer::ProcessKiller;
use super::{ModuleError, ModuleState};

/// Size of the chunks payload files are read in.
const CHUNK_SIZE: usize = 64 * 1024;

/// Number of chunks buffered for a copy task.
const CHUNK_QUEUE: usize = 4;

/// Interval in which a blocked copy task is woken up when cancelled.
const CANCEL_INTERVAL: Duration = Duration::from_millis(10);

/// Party responsible for storing the payload files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downloader {
    /// Not known until the module reads `stream-next` or exits.
    Unknown,
    /// The module reads the files from `streams`.
    Module,
    /// The agent stores the files in `files`.
    Agent,
}

/// Event of the download.
#[derive(Debug)]
pub enum DownloadEvent {
    /// The module process exited.
    ProcessExited(io::Result<ExitStatus>),
    /// A payload file with the given name should be stored.
    NextStream(String),
    /// Writing to `stream-next` completed.
    StreamNextWritten(Result<(), ModuleError>),
    /// Writing the current payload file completed.
    StreamWritten(Result<(), ModuleError>),
    /// All payload files have been stored.
    Finish,
}

/// Result of handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Waiting for more events.
    Continue,
    /// The current payload file has been stored.
    StreamStored,
    /// The download is complete and the module has exited.
    Done,
}

/// Download of a payload by an update module.
#[derive(Debug)]
pub struct ModuleDownload {
    tree: PathBuf,
    pid: Option<u32>,
    exited: Option<Receiver<io::Result<ExitStatus>>>,
    killer: Option<ProcessKiller>,
    downloader: Downloader,
    current: Option<String>,
    finished: bool,
    terminated: bool,
    stream_next: Option<CopyTask>,
    stream: Option<CopyTask>,
}

impl ModuleDownload {
    /// Take over the module process running the `Download` state.
    pub(crate) fn start(
        tree: PathBuf,
        mut child: Child,
        timeout: Duration,
        grace_period: Duration,
    ) -> Result<Self, ModuleError> {
        let pid = child.id();
        let killer = ProcessKiller::start(pid, timeout, grace_period);
        let (exit_tx, exited) = flume::bounded(1);
        let waiter = thread::Builder::new()
            .name("module-waiter".to_owned())
            .spawn(move || {
                let _ = exit_tx.send(child.wait());
            });
        if let Err(error) = waiter {
            // The child has been moved into the closure and dropped, so it cannot be
            // waited for anymore.
            let _ = kill_group(pid, Signal::SIGKILL);
            return Err(ModuleError::Internal(format!(
                "unable to start waiter thread: {error}"
            )));
        }
        Ok(Self::with_process(tree, Some(pid), exited, Some(killer)))
    }

    fn with_process(
        tree: PathBuf,
        pid: Option<u32>,
        exited: Receiver<io::Result<ExitStatus>>,
        killer: Option<ProcessKiller>,
    ) -> Self {
        Self {
            tree,
            pid,
            exited: Some(exited),
            killer,
            downloader: Downloader::Unknown,
            current: None,
            finished: false,
            terminated: false,
            stream_next: None,
            stream: None,
        }
    }

    pub fn downloader(&self) -> Downloader {
        self.downloader
    }

    /// Check whether the module process is still running.
    pub fn is_running(&self) -> bool {
        self.exited.is_some()
    }

    /// Advance the state machine.
    pub fn handle_event(&mut self, event: DownloadEvent) -> Result<Outcome, ModuleError> {
        let result = match event {
            DownloadEvent::ProcessExited(status) => self.handle_process_exit(status),
            DownloadEvent::NextStream(name) => self.handle_next_stream(name),
            DownloadEvent::StreamNextWritten(result) => self.handle_stream_next_written(result),
            DownloadEvent::StreamWritten(result) => self.handle_stream_written(result),
            DownloadEvent::Finish => self.handle_finish(),
        };
        if self.finished && self.exited.is_none() {
            return result.map(|_| Outcome::Done);
        }
        result
    }

    fn handle_process_exit(&mut self, status: io::Result<ExitStatus>) -> Result<Outcome, ModuleError> {
        self.exited = None;
        if let Some(mut killer) = self.killer.take() {
            killer.stop();
        }
        let status = status.map_err(ModuleError::Wait)?;
        debug!(%status, "update module download process exited");
        if !status.success() {
            return Err(ModuleError::Abnormal {
                state: ModuleState::Download,
                status,
            });
        }
        if self.finished {
            return Ok(Outcome::Continue);
        }
        match self.downloader {
            Downloader::Unknown => {
                debug!("update module did not read stream-next, storing files in `files`");
                self.downloader = Downloader::Agent;
                // A write to `stream-next` may still be blocked.
                self.stream_next = None;
                self.prepare_agent_download()?;
                if let Some(name) = self.current.clone() {
                    self.stream = Some(CopyTask::spawn(
                        self.tree.join("files").join(&name),
                        OpenMode::CreateNew,
                    )?);
                }
                Ok(Outcome::Continue)
            }
            Downloader::Module => Err(ModuleError::TerminatedMidDownload),
            Downloader::Agent => Ok(Outcome::Continue),
        }
    }

    fn handle_next_stream(&mut self, name: String) -> Result<Outcome, ModuleError> {
        self.current = Some(name.clone());
        if self.downloader == Downloader::Agent {
            self.stream = Some(CopyTask::spawn(
                self.tree.join("files").join(&name),
                OpenMode::CreateNew,
            )?);
        } else {
            self.stream_next = Some(self.publish_stream_next(Some(&name))?);
        }
        Ok(Outcome::Continue)
    }

    fn handle_stream_next_written(
        &mut self,
        result: Result<(), ModuleError>,
    ) -> Result<Outcome, ModuleError> {
        self.stream_next = None;
        if self.downloader == Downloader::Agent {
            return Ok(Outcome::Continue);
        }
        result?;
        if self.downloader == Downloader::Unknown {
            debug!("update module reads stream-next, streaming files to the module");
            self.downloader = Downloader::Module;
        }
        if self.finished {
            return Ok(Outcome::Continue);
        }
        let name = self.current.clone().ok_or_else(|| {
            ModuleError::Internal("stream-next has been read without a current stream".to_owned())
        })?;
        self.stream = Some(CopyTask::spawn(
            self.tree.join("streams").join(name),
            OpenMode::Existing,
        )?);
        Ok(Outcome::Continue)
    }

    fn handle_stream_written(
        &mut self,
        result: Result<(), ModuleError>,
    ) -> Result<Outcome, ModuleError> {
        self.stream = None;
        result?;
        Ok(Outcome::StreamStored)
    }

    fn handle_finish(&mut self) -> Result<Outcome, ModuleError> {
        self.finished = true;
        if self.downloader == Downloader::Agent {
            nix::unistd::sync();
        } else if self.exited.is_some() {
            self.stream_next = Some(self.publish_stream_next(None)?);
        }
        Ok(Outcome::Continue)
    }

    /// Create the FIFO for the stream and write its name to `stream-next`.
    ///
    /// Without a name, an empty entry is written.
    fn publish_stream_next(&self, name: Option<&str>) -> Result<CopyTask, ModuleError> {
        let entry = match name {
            Some(name) => {
                let path = self.tree.join("streams").join(name);
                nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o600))
                    .map_err(|source| ModuleError::CreateFifo { path, source })?;
                format!("streams/{name}\n")
            }
            None => String::new(),
        };
        let mut task = CopyTask::spawn(self.tree.join("stream-next"), OpenMode::Existing)?;
        task.write_all(Bytes::from(entry))?;
        Ok(task)
    }

    fn prepare_agent_download(&self) -> Result<(), ModuleError> {
        let work_tree_error =
            |path: PathBuf| move |source: io::Error| ModuleError::WorkTree { path, source };
        let streams = self.tree.join("streams");
        fs::remove_dir_all(&streams).map_err(work_tree_error(streams))?;
        let stream_next = self.tree.join("stream-next");
        fs::remove_file(&stream_next).map_err(work_tree_error(stream_next))?;
        let files = self.tree.join("files");
        DirBuilder::new()
            .mode(0o700)
            .create(&files)
            .map_err(work_tree_error(files))
    }

    /// Store a payload file, blocking until it has been consumed.
    pub fn store(&mut self, name: &str, reader: &mut dyn Read) -> Result<(), ModuleError> {
        let result = self.run_store(name, reader);
        if result.is_err() {
            self.current = None;
            self.stream = None;
        }
        result
    }

    fn run_store(&mut self, name: &str, reader: &mut dyn Read) -> Result<(), ModuleError> {
        if self.finished {
            return Err(ModuleError::Internal(
                "payload file stored after finishing the download".to_owned(),
            ));
        }
        // Events which arrived since the last file are handled first.
        while let Some(event) = self.poll_event() {
            self.handle_event(event)?;
        }
        if self.stream.is_some() {
            return Err(ModuleError::Internal(
                "previous payload file is still being stored".to_owned(),
            ));
        }
        self.handle_event(DownloadEvent::NextStream(name.to_owned()))?;
        let mut feed = Feed::new(reader);
        loop {
            let event = self.wait_event(Some(&mut feed))?;
            match self.handle_event(event)? {
                Outcome::Continue => continue,
                Outcome::StreamStored => return Ok(()),
                Outcome::Done => {
                    return Err(ModuleError::Internal(
                        "download finished while storing a file".to_owned(),
                    ))
                }
            }
        }
    }

    /// Signal that all files have been stored and wait for the module to exit.
    ///
    /// May be called after storing a file failed.
    pub fn finish(&mut self) -> Result<(), ModuleError> {
        // Nobody is feeding an interrupted file anymore.
        self.stream = None;
        let mut first_error = None;
        let mut event = DownloadEvent::Finish;
        loop {
            match self.handle_event(event) {
                Ok(Outcome::Done) => break,
                Ok(Outcome::Continue | Outcome::StreamStored) => {}
                Err(error) => {
                    if self.finished && self.exited.is_none() {
                        first_error.get_or_insert(error);
                        break;
                    }
                    warn!("update module download failed, terminating the module: {error}");
                    self.terminate();
                    first_error.get_or_insert(error);
                }
            }
            event = match self.wait_event(None) {
                Ok(event) => event,
                Err(error) => {
                    first_error.get_or_insert(error);
                    self.terminate();
                    break;
                }
            };
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn terminate(&mut self) {
        if self.terminated || self.exited.is_none() {
            return;
        }
        self.terminated = true;
        if let Some(pid) = self.pid {
            let _ = kill_group(pid, Signal::SIGTERM);
        }
    }

    /// Take an already available event.
    ///
    /// Process exits come first, then completed writes to `stream-next`, then
    /// completed writes of the current file.
    fn poll_event(&self) -> Option<DownloadEvent> {
        if let Some(exited) = &self.exited {
            match exited.try_recv() {
                Ok(status) => return Some(DownloadEvent::ProcessExited(status)),
                Err(TryRecvError::Disconnected) => {
                    return Some(DownloadEvent::ProcessExited(Err(waiter_lost())))
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        if let Some(task) = &self.stream_next {
            if let Some(result) = task.try_done() {
                return Some(DownloadEvent::StreamNextWritten(result));
            }
        }
        if let Some(task) = &self.stream {
            if let Some(result) = task.try_done() {
                return Some(DownloadEvent::StreamWritten(result));
            }
        }
        None
    }

    /// Wait for the next event while feeding the current file to its copy task.
    fn wait_event(&mut self, mut feed: Option<&mut Feed<'_>>) -> Result<DownloadEvent, ModuleError> {
        loop {
            if let Some(event) = self.poll_event() {
                return Ok(event);
            }
            let sender = self.stream.as_ref().and_then(CopyTask::sender);
            let chunk = match (feed.as_deref_mut(), &sender) {
                (Some(feed), Some(_)) => feed.next_chunk()?,
                _ => None,
            };
            let mut selector = Selector::new();
            if let Some(exited) = &self.exited {
                selector = selector.recv(exited, |status: Result<_, RecvError>| {
                    Wakeup::Event(DownloadEvent::ProcessExited(
                        status.unwrap_or_else(|_| Err(waiter_lost())),
                    ))
                });
            }
            if let Some(task) = &self.stream_next {
                selector = selector.recv(&task.done, |result| {
                    Wakeup::Event(DownloadEvent::StreamNextWritten(task_result(result)))
                });
            }
            if let Some(task) = &self.stream {
                selector = selector.recv(&task.done, |result| {
                    Wakeup::Event(DownloadEvent::StreamWritten(task_result(result)))
                });
            }
            let has_sources =
                self.exited.is_some() || self.stream_next.is_some() || self.stream.is_some();
            if !has_sources {
                return Err(ModuleError::Internal(
                    "waiting for download events without any source".to_owned(),
                ));
            }
            if let (Some(sender), Some(chunk)) = (&sender, chunk) {
                selector = selector.send(sender, chunk, |result| Wakeup::Sent(result.is_ok()));
            }
            match selector.wait() {
                Wakeup::Event(event) => return Ok(event),
                Wakeup::Sent(sent) => {
                    if let Some(feed) = feed.as_deref_mut() {
                        feed.sent(sent);
                    }
                }
            }
        }
    }
}

impl Drop for ModuleDownload {
    fn drop(&mut self) {
        if self.exited.is_some() {
            warn!("download abandoned, terminating update module");
            self.terminate();
        }
    }
}

enum Wakeup {
    Event(DownloadEvent),
    Sent(bool),
}

fn task_result(result: Result<Result<(), ModuleError>, RecvError>) -> Result<(), ModuleError> {
    result.unwrap_or_else(|_| Err(ModuleError::Internal("copy task vanished".to_owned())))
}

fn waiter_lost() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "waiter thread vanished")
}

fn kill_group(pid: u32, signal: Signal) -> nix::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| nix::Error::EINVAL)?;
    killpg(Pid::from_raw(pid), signal)
}

/// Chunks of a payload file waiting to be handed to a copy task.
struct Feed<'r> {
    reader: &'r mut dyn Read,
    pending: Option<Bytes>,
    done: bool,
}

impl<'r> Feed<'r> {
    fn new(reader: &'r mut dyn Read) -> Self {
        Self {
            reader,
            pending: None,
            done: false,
        }
    }

    /// Chunk to hand over next, an empty chunk marks the end of the file.
    fn next_chunk(&mut self) -> Result<Option<Bytes>, ModuleError> {
        if self.done {
            return Ok(None);
        }
        if self.pending.is_none() {
            let mut buffer = vec![0; CHUNK_SIZE];
            let read = loop {
                match self.reader.read(&mut buffer) {
                    Ok(read) => break read,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => return Err(ModuleError::ReadPayload(error)),
                }
            };
            buffer.truncate(read);
            self.pending = Some(Bytes::from(buffer));
        }
        Ok(self.pending.clone())
    }

    fn sent(&mut self, sent: bool) {
        let chunk = self.pending.take();
        if !sent || chunk.is_some_and(|chunk| chunk.is_empty()) {
            self.done = true;
        }
    }
}

/// How a copy task opens its target.
#[derive(Debug, Clone, Copy)]
enum OpenMode {
    /// Open an existing file or FIFO.
    Existing,
    /// Create a file which must not exist yet.
    CreateNew,
}

/// Thread writing chunks into a file or FIFO.
///
/// Dropping the task cancels it and waits for the thread to finish. A thread
/// blocked opening a FIFO is woken up by briefly opening the FIFO for reading.
#[derive(Debug)]
pub(crate) struct CopyTask {
    path: PathBuf,
    data: Option<Sender<Bytes>>,
    done: Receiver<Result<(), ModuleError>>,
}

impl CopyTask {
    fn spawn(path: PathBuf, mode: OpenMode) -> Result<Self, ModuleError> {
        let (data, chunks) = flume::bounded::<Bytes>(CHUNK_QUEUE);
        let (done_tx, done) = flume::bounded(1);
        let target = path.clone();
        thread::Builder::new()
            .name("module-stream".to_owned())
            .spawn(move || {
                let _ = done_tx.send(copy_chunks(&target, mode, &chunks));
            })
            .map_err(|error| ModuleError::Internal(format!("unable to start copy task: {error}")))?;
        Ok(Self {
            path,
            data: Some(data),
            done,
        })
    }

    /// Queue the complete contents of the target.
    fn write_all(&mut self, contents: Bytes) -> Result<(), ModuleError> {
        let stream_error = |path: &Path| ModuleError::Stream {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "copy task stopped"),
        };
        let Some(data) = self.data.take() else {
            return Err(stream_error(&self.path));
        };
        if !contents.is_empty() {
            data.send(contents).map_err(|_| stream_error(&self.path))?;
        }
        data.send(Bytes::new()).map_err(|_| stream_error(&self.path))
    }

    fn sender(&self) -> Option<Sender<Bytes>> {
        self.data.clone()
    }

    fn try_done(&self) -> Option<Result<(), ModuleError>> {
        match self.done.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(task_result(Err(RecvError::Disconnected))),
        }
    }
}

impl Drop for CopyTask {
    fn drop(&mut self) {
        self.data = None;
        loop {
            match self.done.recv_timeout(CANCEL_INTERVAL) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let nudge = OpenOptions::new()
                        .read(true)
                        .custom_flags(libc::O_NONBLOCK)
                        .open(&self.path);
                    drop(nudge);
                }
            }
        }
    }
}

fn copy_chunks(path: &Path, mode: OpenMode, chunks: &Receiver<Bytes>) -> Result<(), ModuleError> {
    let stream_error = |source| ModuleError::Stream {
        path: path.to_path_buf(),
        source,
    };
    let mut options = OpenOptions::new();
    options.write(true);
    if let OpenMode::CreateNew = mode {
        options.create_new(true).mode(0o600);
    }
    let mut file: File = options.open(path).map_err(stream_error)?;
    loop {
        match chunks.recv() {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => file.write_all(&chunk).map_err(stream_error)?,
            Err(RecvError::Disconnected) => {
                return Err(stream_error(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "streaming has been cancelled",
                )))
            }
        }
    }
    if let OpenMode::CreateNew = mode {
        file.sync_all().map_err(stream_error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("streams")).unwrap();
        nix::unistd::mkfifo(&dir.path().join("stream-next"), Mode::from_bits_truncate(0o600))
            .unwrap();
        dir
    }

    fn download(tree: &Path) -> (ModuleDownload, Sender<io::Result<ExitStatus>>) {
        let (exit_tx, exited) = flume::bounded(1);
        (
            ModuleDownload::with_process(tree.to_path_buf(), None, exited, None),
            exit_tx,
        )
    }

    #[test]
    fn test_agent_driven_when_module_exits() {
        let tree = tree();
        let (mut download, exit_tx) = download(tree.path());
        assert_eq!(
            download
                .handle_event(DownloadEvent::NextStream("a".to_owned()))
                .unwrap(),
            Outcome::Continue
        );
        assert!(tree.path().join("streams/a").exists());
        exit_tx.send(Ok(ExitStatus::from_raw(0))).unwrap();
        let event = download.wait_event(None).unwrap();
        assert!(matches!(event, DownloadEvent::ProcessExited(Ok(_))));
        download.handle_event(event).unwrap();
        assert_eq!(download.downloader(), Downloader::Agent);
        assert!(!tree.path().join("streams").exists());
        assert!(!tree.path().join("stream-next").exists());
        let mut reader: &[u8] = b"contents of a";
        let mut feed = Feed::new(&mut reader);
        let event = download.wait_event(Some(&mut feed)).unwrap();
        assert_eq!(download.handle_event(event).unwrap(), Outcome::StreamStored);
        assert_eq!(
            fs::read(tree.path().join("files/a")).unwrap(),
            b"contents of a"
        );
        assert_eq!(
            download.handle_event(DownloadEvent::Finish).unwrap(),
            Outcome::Done
        );
    }

    #[test]
    fn test_abnormal_exit() {
        let tree = tree();
        let (mut download, _) = download(tree.path());
        assert!(matches!(
            download.handle_event(DownloadEvent::ProcessExited(Ok(ExitStatus::from_raw(1 << 8)))),
            Err(ModuleError::Abnormal { .. })
        ));
    }

    #[test]
    fn test_exit_in_module_driven_download() {
        let tree = tree();
        let (mut download, _) = download(tree.path());
        download
            .handle_event(DownloadEvent::NextStream("a".to_owned()))
            .unwrap();
        download.stream_next = None;
        download
            .handle_event(DownloadEvent::StreamNextWritten(Ok(())))
            .unwrap();
        assert_eq!(download.downloader(), Downloader::Module);
        assert!(download.stream.is_some());
        assert!(matches!(
            download.handle_event(DownloadEvent::ProcessExited(Ok(ExitStatus::from_raw(0)))),
            Err(ModuleError::TerminatedMidDownload)
        ));
    }

    #[test]
    fn test_stream_next_ignored_once_agent_driven() {
        let tree = tree();
        let (mut download, _) = download(tree.path());
        download
            .handle_event(DownloadEvent::ProcessExited(Ok(ExitStatus::from_raw(0))))
            .unwrap();
        assert_eq!(download.downloader(), Downloader::Agent);
        assert_eq!(
            download
                .handle_event(DownloadEvent::StreamNextWritten(Err(ModuleError::Internal(
                    "late".to_owned()
                ))))
                .unwrap(),
            Outcome::Continue
        );
    }

    #[test]
    fn test_dropping_blocked_task() {
        let tree = tree();
        let mut task =
            CopyTask::spawn(tree.path().join("stream-next"), OpenMode::Existing).unwrap();
        task.write_all(Bytes::from_static(b"streams/a\n")).unwrap();
        // Nobody reads the FIFO, dropping must not hang.
        drop(task);
    }
}
