//! Communication with a connected Attys.
//!
//! [`AttysComm`] takes ownership of an open serial stream, uploads the
//! acquisition settings and then decodes the sample stream in a background
//! task. Samples are handed to an optional listener, an optional recorder
//! and a ring buffer which can be polled by the application.

use core::fmt;
use std::{
   io,
   path::Path,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::{atomic::AtomicCell, queue::ArrayQueue};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use smol_str::SmolStr;
use tokio::{
   io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
   select,
   sync::watch,
   task::JoinHandle,
   time,
};

use crate::{
   attys::{
      parser::Decoder,
      protocol::{
         AttysSettings, CMD_START_ADC, CMD_STOP_ADC, MAG_FULL_SCALE, REPLY_OK, Sample,
      },
      recorder::DataRecorder,
   },
   error::{AttysError, Result},
};

/// Number of samples kept for polling.
const RINGBUFFER_SIZE: usize = 1000;
/// How often the stop command is repeated before giving up
const STOP_ATTEMPTS: usize = 10;
/// Lines to skip while waiting for an `OK`
const MAX_REPLY_LINES: usize = 100;
/// Timeout for a single reply line
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// Attempts to upload the settings
const INIT_ATTEMPTS: u32 = 3;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits the stream into lines, replacing bytes that are not UTF-8.
///
/// A line cut short by a timeout is resumed on the next call.
struct LineReader {
   reader: BufReader<BoxedReader>,
   buf: Vec<u8>,
}

impl LineReader {
   fn new(reader: BoxedReader) -> Self {
      Self {
         reader: BufReader::new(reader),
         buf: Vec::new(),
      }
   }

   async fn next_line(&mut self) -> io::Result<Option<String>> {
      let n = self.reader.read_until(b'\n', &mut self.buf).await?;
      if n == 0 && self.buf.is_empty() {
         return Ok(None);
      }
      let line = String::from_utf8_lossy(&self.buf)
         .trim_end_matches(['\r', '\n'])
         .to_owned();
      self.buf.clear();
      Ok(Some(line))
   }
}

/// Messages sent to the [`MessageListener`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum CommMessage {
   Connected = 0,
   Error = 1,
   Retry = 2,
   Configure = 3,
   StartedRecording = 4,
   StoppedRecording = 5,
   Connecting = 6,
}

impl CommMessage {
   pub const fn code(self) -> u8 {
      self as u8
   }
}

/// Receives every sample together with its sample number.
pub trait DataListener: Send + Sync {
   fn got_data(&self, sample_number: u64, sample: &Sample);
}

impl<F> DataListener for F
where
   F: Fn(u64, &Sample) + Send + Sync,
{
   fn got_data(&self, sample_number: u64, sample: &Sample) {
      self(sample_number, sample);
   }
}

/// Receives connection state changes.
pub trait MessageListener: Send + Sync {
   fn have_message(&self, msg: CommMessage);
}

impl<F> MessageListener for F
where
   F: Fn(CommMessage) + Send + Sync,
{
   fn have_message(&self, msg: CommMessage) {
      self(msg);
   }
}

pub type DataListenerRef = Arc<dyn DataListener>;
pub type MessageListenerRef = Arc<dyn MessageListener>;

struct AttysCommInner {
   address: Address,
   name: SmolStr,
   settings: AttysSettings,
   io: Mutex<Option<(BoxedReader, BoxedWriter)>>,
   ring: ArrayQueue<Sample>,
   sample_number: AtomicU64,
   timestamp: AtomicCell<f64>,
   is_connected: AtomicBool,
   is_running: AtomicBool,
   fatal_error: AtomicBool,
   data_listener: Mutex<Option<DataListenerRef>>,
   message_listener: Mutex<Option<MessageListenerRef>>,
   recorder: Mutex<DataRecorder>,
   quit_tx: watch::Sender<bool>,
   task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one connected Attys.
///
/// This type is cheaply cloneable and thread-safe. The acquisition task
/// stops when [`AttysComm::quit`] is called or when the last handle is
/// dropped.
#[derive(Clone)]
pub struct AttysComm(Arc<AttysCommInner>);

#[derive(Clone)]
struct WeakAttysComm(Weak<AttysCommInner>);

impl WeakAttysComm {
   fn new(comm: &AttysComm) -> Self {
      Self(Arc::downgrade(&comm.0))
   }

   fn upgrade(&self) -> Option<AttysComm> {
      self.0.upgrade().map(AttysComm)
   }
}

impl fmt::Debug for AttysComm {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AttysComm")
         .field("address", &self.0.address)
         .field("name", &self.0.name)
         .field("connected", &self.has_active_connection())
         .field("sample_number", &self.sample_number())
         .finish_non_exhaustive()
   }
}

impl AttysComm {
   /// Wraps an open stream to an Attys. Nothing is sent until
   /// [`start`](Self::start) is called.
   pub fn new<S>(stream: S, address: Address, name: impl Into<SmolStr>, settings: AttysSettings) -> Self
   where
      S: AsyncRead + AsyncWrite + Send + 'static,
   {
      let (reader, writer) = tokio::io::split(stream);
      let (quit_tx, _) = watch::channel(false);
      Self(Arc::new(AttysCommInner {
         address,
         name: name.into(),
         settings,
         io: Mutex::new(Some((Box::new(reader), Box::new(writer)))),
         ring: ArrayQueue::new(RINGBUFFER_SIZE),
         sample_number: AtomicU64::new(0),
         timestamp: AtomicCell::new(0.0),
         is_connected: AtomicBool::new(false),
         is_running: AtomicBool::new(false),
         fatal_error: AtomicBool::new(false),
         data_listener: Mutex::new(None),
         message_listener: Mutex::new(None),
         recorder: Mutex::new(DataRecorder::new()),
         quit_tx,
         task: Mutex::new(None),
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn name(&self) -> &SmolStr {
      &self.0.name
   }

   pub fn settings(&self) -> &AttysSettings {
      &self.0.settings
   }

   pub fn sampling_rate_hz(&self) -> u32 {
      self.0.settings.sampling_rate.hz()
   }

   /// Full scale range of ADC channel 0 or 1 in volts.
   pub fn adc_full_scale(&self, channel: usize) -> Option<f32> {
      self.0.settings.adc(channel).map(|adc| adc.gain.full_scale())
   }

   pub fn accel_full_scale(&self) -> f32 {
      self.0.settings.accel_range.full_scale()
   }

   pub const fn mag_full_scale(&self) -> f32 {
      MAG_FULL_SCALE
   }

   /// Spawns the acquisition task.
   ///
   /// Must be called from within a tokio runtime.
   pub fn start(&self) -> Result<()> {
      let (reader, writer) = self.0.io.lock().take().ok_or(AttysError::AlreadyStarted)?;
      let quit_rx = self.0.quit_tx.subscribe();
      self.0.is_running.store(true, Ordering::Relaxed);
      let handle = tokio::spawn(acquisition(
         WeakAttysComm::new(self),
         self.address(),
         self.0.settings,
         reader,
         writer,
         quit_rx,
      ));
      *self.0.task.lock() = Some(handle);
      Ok(())
   }

   /// Stops the acquisition and closes the stream. Safe to call repeatedly.
   pub fn quit(&self) {
      if !self.0.quit_tx.send_replace(true) {
         debug!("{}: stopping acquisition", self.address());
      }
      // never started: close the stream right away
      let _ = self.0.io.lock().take();
      if let Err(e) = self.stop_recording() {
         warn!("{}: failed to stop recording: {e}", self.address());
      }
   }

   /// True once [`quit`](Self::quit) has been called.
   pub fn is_quitting(&self) -> bool {
      *self.0.quit_tx.borrow()
   }

   /// Waits for the acquisition task to finish.
   pub async fn wait(&self) {
      let handle = self.0.task.lock().take();
      if let Some(handle) = handle
         && let Err(e) = handle.await
      {
         error!("{}: acquisition task failed: {e}", self.address());
      }
   }

   /// True from [`start`](Self::start) until the acquisition task ends,
   /// whether by quit, error or the device hanging up.
   pub fn is_running(&self) -> bool {
      self.0.is_running.load(Ordering::Relaxed)
   }

   pub fn has_active_connection(&self) -> bool {
      self.0.is_connected.load(Ordering::Relaxed)
   }

   pub fn has_fatal_error(&self) -> bool {
      self.0.fatal_error.load(Ordering::Relaxed)
   }

   pub fn register_data_listener(&self, listener: DataListenerRef) {
      *self.0.data_listener.lock() = Some(listener);
   }

   pub fn unregister_data_listener(&self) {
      *self.0.data_listener.lock() = None;
   }

   pub fn register_message_listener(&self, listener: MessageListenerRef) {
      *self.0.message_listener.lock() = Some(listener);
   }

   pub fn unregister_message_listener(&self) {
      *self.0.message_listener.lock() = None;
   }

   // === Ring buffer ===

   /// Pops the oldest buffered sample.
   pub fn sample_from_buffer(&self) -> Option<Sample> {
      self.0.ring.pop()
   }

   pub fn is_sample_available(&self) -> bool {
      !self.0.ring.is_empty()
   }

   pub fn num_samples_available(&self) -> usize {
      self.0.ring.len()
   }

   pub fn reset_ringbuffer(&self) {
      while self.0.ring.pop().is_some() {}
   }

   pub fn sample_number(&self) -> u64 {
      self.0.sample_number.load(Ordering::Relaxed)
   }

   pub fn set_sample_number(&self, n: u64) {
      self.0.sample_number.store(n, Ordering::Relaxed);
   }

   /// Seconds since start, derived from the number of samples received.
   pub fn timestamp(&self) -> f64 {
      self.0.timestamp.load()
   }

   pub fn set_timestamp(&self, ts: f64) {
      self.0.timestamp.store(ts);
   }

   // === Recording ===

   /// Access to the recorder, e.g. to change the separator.
   pub fn recorder(&self) -> MutexGuard<'_, DataRecorder> {
      self.0.recorder.lock()
   }

   pub fn start_recording(&self, path: impl AsRef<Path>) -> Result<()> {
      self.recorder().start_rec(path)?;
      self.notify(CommMessage::StartedRecording);
      Ok(())
   }

   pub fn stop_recording(&self) -> Result<()> {
      let was_recording = {
         let mut recorder = self.recorder();
         let was_recording = recorder.is_recording();
         recorder.stop_rec()?;
         was_recording
      };
      if was_recording {
         self.notify(CommMessage::StoppedRecording);
      }
      Ok(())
   }

   fn notify(&self, msg: CommMessage) {
      let listener = self.0.message_listener.lock().clone();
      if let Some(listener) = listener {
         listener.have_message(msg);
      }
   }

   fn push_samples(&self, samples: &[Sample]) {
      let rate = self.sampling_rate_hz();
      let listener = self.0.data_listener.lock().clone();
      for sample in samples {
         let n = self.0.sample_number.fetch_add(1, Ordering::Relaxed);
         if let Some(listener) = &listener {
            listener.got_data(n, sample);
         }

         let mut recorder = self.0.recorder.lock();
         if let Err(e) = recorder.save_data(n, rate, sample) {
            warn!("{}: recording failed, stopping it: {e}", self.address());
            let _ = recorder.stop_rec();
            drop(recorder);
            self.notify(CommMessage::StoppedRecording);
         }

         self.0.ring.force_push(*sample);
         self.0.timestamp.store(self.0.timestamp.load() + 1.0 / f64::from(rate));
      }
   }
}

fn notify_weak(weak: &WeakAttysComm, msg: CommMessage) {
   if let Some(this) = weak.upgrade() {
      this.notify(msg);
   }
}

async fn quit_requested(rx: &mut watch::Receiver<bool>) {
   // a dropped sender means every handle is gone
   let _ = rx.wait_for(|quit| *quit).await;
}

async fn acquisition(
   weak: WeakAttysComm,
   addr: Address,
   settings: AttysSettings,
   reader: BoxedReader,
   mut writer: BoxedWriter,
   mut quit_rx: watch::Receiver<bool>,
) {
   let mut lines = LineReader::new(reader);

   let result = select! {
      r = run(&weak, addr, settings, &mut lines, &mut writer) => r,
      () = quit_requested(&mut quit_rx) => Ok(()),
   };

   if let Some(this) = weak.upgrade() {
      this.0.is_connected.store(false, Ordering::Relaxed);
   }
   match result {
      Ok(()) => info!("{addr}: data acquisition has been shut down"),
      Err(AttysError::ConnectionClosed) => warn!("{addr}: stream lost"),
      Err(e) => {
         error!("{addr}: data acquisition failed: {e}");
         if let Some(this) = weak.upgrade() {
            this.0.fatal_error.store(true, Ordering::Relaxed);
            this.notify(CommMessage::Error);
         }
      },
   }

   // best effort, the device may already be gone
   let _ = time::timeout(REPLY_TIMEOUT, async {
      writer.write_all(CMD_STOP_ADC).await?;
      writer.shutdown().await
   })
   .await;

   if let Some(this) = weak.upgrade() {
      this.0.is_running.store(false, Ordering::Relaxed);
   }
}

async fn run(
   weak: &WeakAttysComm,
   addr: Address,
   settings: AttysSettings,
   lines: &mut LineReader,
   writer: &mut BoxedWriter,
) -> Result<()> {
   notify_weak(weak, CommMessage::Connecting);

   let mut attempt = 1;
   loop {
      notify_weak(weak, CommMessage::Configure);
      match initialize(lines, writer, &settings).await {
         Ok(()) => break,
         Err(e) if attempt < INIT_ATTEMPTS => {
            warn!("{addr}: configuring failed ({e}), retrying");
            notify_weak(weak, CommMessage::Retry);
            attempt += 1;
         },
         Err(e) => return Err(e),
      }
   }

   let Some(this) = weak.upgrade() else {
      return Ok(());
   };
   this.0.is_connected.store(true, Ordering::Relaxed);
   this.notify(CommMessage::Connected);
   drop(this);
   info!("{addr}: starting main data acquisition loop");

   let mut decoder = Decoder::new(settings);
   loop {
      let Some(line) = lines.next_line().await? else {
         return Err(AttysError::ConnectionClosed);
      };
      let line = line.trim();
      if line.is_empty() {
         continue;
      }
      if line == REPLY_OK {
         debug!("{addr}: OK caught from the Attys");
         continue;
      }

      let samples = decoder.decode_line(line);
      let Some(this) = weak.upgrade() else {
         warn!("{addr}: AttysComm instance was dropped");
         return Ok(());
      };
      this.push_samples(&samples);
   }
}

/// Stops the ADC, uploads the settings and restarts the ADC.
async fn initialize(
   lines: &mut LineReader,
   writer: &mut BoxedWriter,
   settings: &AttysSettings,
) -> Result<()> {
   stop_adc(lines, writer).await?;
   for cmd in settings.init_commands() {
      send_sync_command(lines, writer, &cmd).await?;
   }
   writer.write_all(CMD_START_ADC).await?;
   writer.flush().await?;
   debug!("ADC started. Now acquiring data.");
   Ok(())
}

async fn stop_adc(lines: &mut LineReader, writer: &mut BoxedWriter) -> Result<()> {
   for attempt in 1..=STOP_ATTEMPTS {
      debug!("Trying to stop the data acquisition. Attempt #{attempt}.");
      writer.write_all(CMD_STOP_ADC).await?;
      writer.flush().await?;
      if wait_for_ok(lines).await? {
         debug!("ADC stopped. Now in command mode.");
         return Ok(());
      }
   }
   Err(AttysError::NoReply("x=0".into()))
}

async fn send_sync_command(lines: &mut LineReader, writer: &mut BoxedWriter, cmd: &str) -> Result<()> {
   writer.write_all(cmd.as_bytes()).await?;
   writer.flush().await?;
   if wait_for_ok(lines).await? {
      debug!("Sent successfully {:?} to the Attys.", cmd.trim());
      Ok(())
   } else {
      Err(AttysError::NoReply(cmd.trim().to_owned()))
   }
}

/// Skips lines until an `OK` arrives. False if none came in time.
async fn wait_for_ok(lines: &mut LineReader) -> Result<bool> {
   for _ in 0..MAX_REPLY_LINES {
      match time::timeout(REPLY_TIMEOUT, lines.next_line()).await {
         Err(_) => return Ok(false),
         Ok(Ok(Some(line))) if line.trim() == REPLY_OK => return Ok(true),
         Ok(Ok(Some(_))) => {},
         Ok(Ok(None)) => return Err(AttysError::ConnectionClosed),
         Ok(Err(e)) => return Err(e.into()),
      }
   }
   Ok(false)
}
